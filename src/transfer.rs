/* src/transfer.rs */

use crate::error::ResolveError;
use crate::materializer::materialize;
use crate::resolver::DnsResolver;
use fancy_log::{LogLevel, log};
use hickory_proto::op::Query;
use hickory_proto::rr::Record;
use hickory_proto::serialize::binary::BinEncodable;
use tokio::sync::mpsc;

/// One batch of records, written to the wire as a single DNS message.
pub type Envelope = Vec<Record>;

/// Capacity of the channel between the zone dump and the TCP writer.
pub const ENVELOPE_QUEUE_DEPTH: usize = 4;

/// Encoded record bytes per envelope before a new one is started.
pub const ENVELOPE_BYTES: usize = 16 * 1024;

/// Streams a full copy of the queried zone into `sink`: the SOA, every other
/// record set in store order, then the SOA again. AXFR and IXFR alike.
///
/// The zone is fully materialized before the first envelope is sent, so any
/// failure leaves the sink untouched. Dropping `sink` on return marks the end
/// of the transfer.
pub async fn transfer_zone(
    resolver: &DnsResolver,
    query: &Query,
    sink: mpsc::Sender<Envelope>,
) -> Result<(), ResolveError> {
    let zone_name = query.name().to_string().to_lowercase();
    let storage = resolver.storage();

    let zone = storage
        .get_zone_by_name(&zone_name)
        .await
        .map_err(|source| ResolveError::ZoneLookup {
            zone: zone_name.clone(),
            source,
        })?;

    let soa = resolver.soa_record(&zone_name).await?;

    let record_sets = storage
        .get_zone_record_sets(&zone, None, Some("SOA"))
        .await
        .map_err(|source| ResolveError::ZoneLookup {
            zone: zone_name.clone(),
            source,
        })?;

    let mut records = vec![soa.clone()];
    for record_set in &record_sets {
        records.extend(materialize(storage, record_set).await?);
    }
    records.push(soa);

    log(
        LogLevel::Info,
        &format!(
            "Transferring {} ({} record sets, {} records)",
            zone.name,
            record_sets.len(),
            records.len()
        ),
    );

    let envelopes = into_envelopes(records, ENVELOPE_BYTES)?;
    for envelope in envelopes {
        if sink.send(envelope).await.is_err() {
            log(
                LogLevel::Debug,
                &format!("Transfer of {} abandoned by the writer", zone.name),
            );
            break;
        }
    }
    Ok(())
}

/// Splits records into envelopes of roughly `limit` encoded bytes each.
/// A record larger than `limit` gets an envelope of its own. Fails on the
/// first record that cannot be encoded.
pub fn into_envelopes(records: Vec<Record>, limit: usize) -> Result<Vec<Envelope>, ResolveError> {
    let mut envelopes = Vec::new();
    let mut current: Envelope = Vec::new();
    let mut size = 0;

    for record in records {
        let len = record
            .to_bytes()
            .map_err(|e| ResolveError::Unencodable {
                owner: record.name().to_string(),
                rtype: record.record_type().to_string(),
                reason: e.to_string(),
            })?
            .len();
        if !current.is_empty() && size + len > limit {
            envelopes.push(std::mem::take(&mut current));
            size = 0;
        }
        size += len;
        current.push(record);
    }
    if !current.is_empty() {
        envelopes.push(current);
    }
    Ok(envelopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, record_set, zone};
    use hickory_proto::rr::rdata::TXT;
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::str::FromStr;
    use std::sync::Arc;

    fn example_storage() -> MemoryStorage {
        MemoryStorage::new()
            .with_zone(zone("d1", "example.com.", 3600))
            .with_record_set(record_set(
                "soa",
                "d1",
                "example.com.",
                "SOA",
                None,
                &[("ns1.example.com. hostmaster.example.com. 1 3600 600 86400 300", None)],
            ))
            .with_record_set(record_set(
                "a",
                "d1",
                "www.example.com.",
                "A",
                None,
                &[("1.2.3.4", None)],
            ))
            .with_record_set(record_set(
                "mx",
                "d1",
                "example.com.",
                "MX",
                None,
                &[("mail.example.com.", Some(10))],
            ))
    }

    fn axfr(name: &str) -> Query {
        Query::query(Name::from_str(name).unwrap(), RecordType::AXFR)
    }

    async fn run(storage: MemoryStorage, name: &str) -> (Result<(), ResolveError>, Vec<Envelope>) {
        let resolver = DnsResolver::new(Arc::new(storage));
        let (tx, mut rx) = mpsc::channel(ENVELOPE_QUEUE_DEPTH);
        let query = axfr(name);
        let collect = async {
            let mut envelopes = Vec::new();
            while let Some(envelope) = rx.recv().await {
                envelopes.push(envelope);
            }
            envelopes
        };
        tokio::join!(transfer_zone(&resolver, &query, tx), collect)
    }

    #[tokio::test]
    async fn zone_is_bracketed_by_soa() {
        let (result, envelopes) = run(example_storage(), "example.com.").await;
        result.unwrap();

        let records: Vec<Record> = envelopes.into_iter().flatten().collect();
        let types: Vec<RecordType> = records.iter().map(|r| r.record_type()).collect();
        assert_eq!(
            types,
            [RecordType::SOA, RecordType::A, RecordType::MX, RecordType::SOA]
        );
        assert_eq!(records.first(), records.last());
    }

    #[tokio::test]
    async fn unknown_zone_sends_nothing() {
        let (result, envelopes) = run(example_storage(), "example.net.").await;
        assert!(matches!(result, Err(ResolveError::ZoneLookup { .. })));
        assert!(envelopes.is_empty());
    }

    #[tokio::test]
    async fn any_record_set_failure_aborts_everything() {
        // SOA resolves by name; the A and MX sets need their zone by id.
        let (result, envelopes) =
            run(example_storage().failing_id_lookups(), "example.com.").await;
        assert!(result.is_err());
        assert!(envelopes.is_empty());
    }

    #[tokio::test]
    async fn skipped_records_do_not_abort_transfer() {
        let storage = example_storage().with_record_set(record_set(
            "ptr",
            "d1",
            "4.3.2.1.in-addr.arpa.",
            "PTR",
            Some(60),
            &[("www.example.com.", None)],
        ));
        let (result, envelopes) = run(storage, "example.com.").await;
        result.unwrap();
        assert_eq!(envelopes.into_iter().flatten().count(), 4);
    }

    #[test]
    fn unencodable_record_fails_the_split() {
        let owner = Name::from_str("example.com.").unwrap();
        let records = vec![
            Record::from_rdata(owner.clone(), 60, RData::TXT(TXT::new(vec!["ok".into()]))),
            Record::from_rdata(owner, 60, RData::TXT(TXT::new(vec!["x".repeat(300)]))),
        ];
        assert!(matches!(
            into_envelopes(records, ENVELOPE_BYTES),
            Err(ResolveError::Unencodable { .. })
        ));
    }

    #[tokio::test]
    async fn large_zone_with_long_txt_is_complete() {
        let addresses: Vec<String> = (0..1000)
            .map(|i| format!("10.0.{}.{}", i / 256, i % 256))
            .collect();
        let addresses: Vec<(&str, Option<i64>)> =
            addresses.iter().map(|a| (a.as_str(), None)).collect();
        let long = "x".repeat(300);
        let storage = example_storage()
            .with_record_set(record_set(
                "many",
                "d1",
                "many.example.com.",
                "A",
                Some(60),
                &addresses,
            ))
            .with_record_set(record_set(
                "txt",
                "d1",
                "long.example.com.",
                "TXT",
                Some(60),
                &[(long.as_str(), None)],
            ));

        let (result, envelopes) = run(storage, "example.com.").await;
        result.unwrap();
        assert!(envelopes.len() > 1);

        let records: Vec<Record> = envelopes.into_iter().flatten().collect();
        assert_eq!(records.len(), 4 + 1000 + 1);
        assert_eq!(records.first().unwrap().record_type(), RecordType::SOA);
        assert_eq!(records.last().unwrap().record_type(), RecordType::SOA);
        assert!(records.iter().any(|r| r.record_type() == RecordType::TXT));
    }

    #[test]
    fn envelopes_split_on_size() {
        let owner = Name::from_str("example.com.").unwrap();
        let records: Vec<Record> = (0..10)
            .map(|_| {
                Record::from_rdata(
                    owner.clone(),
                    60,
                    RData::TXT(TXT::new(vec!["x".repeat(200)])),
                )
            })
            .collect();
        let one = records[0].to_bytes().unwrap().len();

        let envelopes = into_envelopes(records.clone(), one * 3).unwrap();
        assert_eq!(
            envelopes.iter().map(Vec::len).collect::<Vec<_>>(),
            [3, 3, 3, 1]
        );

        let whole = into_envelopes(records, ENVELOPE_BYTES).unwrap();
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].len(), 10);
    }
}
