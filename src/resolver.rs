/* src/resolver.rs */

use crate::error::ResolveError;
use crate::materializer::materialize;
use crate::models::{Soa, mailbox_from_email};
use crate::storage::Storage;
use crate::ttl::resolve_ttl;
use fancy_log::{LogLevel, log};
use hickory_proto::op::Query;
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::str::FromStr;
use std::sync::Arc;

/// Answers standard queries straight from the store. Holds no per-query state.
pub struct DnsResolver {
    storage: Arc<dyn Storage>,
}

impl DnsResolver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// The main resolution logic.
    pub async fn resolve(&self, query: &Query) -> Result<Vec<Record>, ResolveError> {
        let name = query.name().to_string().to_lowercase();
        let rtype = query.query_type();

        if rtype == RecordType::SOA {
            return self.soa_record(&name).await.map(|soa| vec![soa]);
        }

        let rtype = rtype.to_string();
        log(
            LogLevel::Debug,
            &format!("Attempting to resolve RRSet {} {}", name, rtype),
        );
        let record_set = self
            .storage
            .get_record_set(&name, &rtype)
            .await
            .map_err(|source| ResolveError::RecordSetLookup {
                name: name.clone(),
                rtype,
                source,
            })?;

        materialize(self.storage(), &record_set).await
    }

    /// Builds the zone's SOA from the zone row plus its SOA record set.
    ///
    /// The zone supplies owner, TTL, serial and timers; the mailbox comes from
    /// the zone email. MINIMUM is the SOA record set's effective TTL.
    pub async fn soa_record(&self, zone_name: &str) -> Result<Record, ResolveError> {
        let zone = self
            .storage
            .get_zone_by_name(zone_name)
            .await
            .map_err(|source| ResolveError::ZoneLookup {
                zone: zone_name.to_string(),
                source,
            })?;
        let record_set = self
            .storage
            .get_record_set(zone_name, "SOA")
            .await
            .map_err(|source| ResolveError::RecordSetLookup {
                name: zone_name.to_string(),
                rtype: "SOA".to_string(),
                source,
            })?;
        let minttl = resolve_ttl(self.storage(), &record_set).await?;

        let primary_ns = record_set
            .records
            .first()
            .and_then(|record| Soa::decode(&record.data).ok())
            .map(|soa| soa.ns)
            .unwrap_or_else(|| record_set.name.clone());

        let malformed = |what: &str, value: &str, e: hickory_proto::ProtoError| {
            ResolveError::MalformedRecord {
                id: record_set.id.clone(),
                rtype: "SOA".to_string(),
                reason: format!("bad {} {:?}: {}", what, value, e),
            }
        };
        let owner = Name::from_str(&zone.name).map_err(|e| malformed("zone name", &zone.name, e))?;
        let mname = Name::from_str(&primary_ns).map_err(|e| malformed("primary ns", &primary_ns, e))?;
        let mailbox = mailbox_from_email(&zone.email);
        let rname = Name::from_str(&mailbox).map_err(|e| malformed("mailbox", &mailbox, e))?;

        let soa = SOA::new(
            mname,
            rname,
            zone.serial,
            zone.refresh as i32,
            zone.retry as i32,
            zone.expire as i32,
            minttl,
        );
        Ok(Record::from_rdata(owner, zone.ttl, RData::SOA(soa)))
    }
}
