/* src/materializer.rs */

//! Turns stored rows into wire-ready resource records.
//!
//! Encoding is table driven: each supported type registers one [`Encoder`]
//! that decodes a row's `data` (and priority, where relevant) into `RData`.
//! Supporting a new type means adding an entry to [`ENCODERS`].

use crate::error::ResolveError;
use crate::models::{RecordSet, Soa, Srv, StoredRecord};
use crate::storage::Storage;
use crate::ttl::resolve_ttl;
use fancy_log::{LogLevel, log};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, SOA, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

type EncodeFn = fn(&StoredRecord) -> Result<RData, String>;

const TXT_STRING_MAX: usize = 255;

#[derive(Clone, Copy)]
pub struct Encoder {
    encode: EncodeFn,
    /// Records are emitted in ascending priority order.
    by_priority: bool,
}

pub static ENCODERS: Lazy<HashMap<RecordType, Encoder>> = Lazy::new(|| {
    let plain = |encode: EncodeFn| Encoder {
        encode,
        by_priority: false,
    };
    let prioritized = |encode: EncodeFn| Encoder {
        encode,
        by_priority: true,
    };
    HashMap::from([
        (RecordType::A, plain(encode_a)),
        (RecordType::AAAA, plain(encode_aaaa)),
        (RecordType::CNAME, plain(encode_cname)),
        (RecordType::NS, plain(encode_ns)),
        (RecordType::MX, prioritized(encode_mx)),
        (RecordType::SRV, prioritized(encode_srv)),
        (RecordType::SOA, plain(encode_soa)),
        (RecordType::TXT, plain(encode_txt)),
    ])
});

/// Record types with a registered encoder.
pub fn supported_types() -> impl Iterator<Item = RecordType> {
    ENCODERS.keys().copied()
}

/// Builds the resource records of `record_set`.
///
/// The set's stored type decides the encoding. Records that fail to decode
/// are logged and skipped. Only TTL resolution can fail the whole call.
pub async fn materialize(
    storage: &dyn Storage,
    record_set: &RecordSet,
) -> Result<Vec<Record>, ResolveError> {
    if record_set.records.is_empty() {
        return Ok(Vec::new());
    }

    let ttl = resolve_ttl(storage, record_set).await?;

    let owner = match Name::from_str(&record_set.name) {
        Ok(name) => name,
        Err(e) => {
            report_skip(&ResolveError::MalformedRecord {
                id: record_set.id.clone(),
                rtype: record_set.rtype.clone(),
                reason: format!("bad owner name {:?}: {}", record_set.name, e),
            });
            return Ok(Vec::new());
        }
    };

    let encoder = RecordType::from_str(&record_set.rtype)
        .ok()
        .and_then(|rtype| ENCODERS.get(&rtype).copied());
    let Some(encoder) = encoder else {
        for record in &record_set.records {
            report_skip(&ResolveError::UnhandledRecordType {
                id: record.id.clone(),
                rtype: record_set.rtype.clone(),
            });
        }
        return Ok(Vec::new());
    };

    let mut ordered: Vec<&StoredRecord> = record_set.records.iter().collect();
    if encoder.by_priority {
        // Stable: equal priorities keep their stored order.
        ordered.sort_by_key(|record| record.effective_priority());
    }

    let mut records = Vec::with_capacity(ordered.len());
    for record in ordered {
        let encoded = (encoder.encode)(record).and_then(|rdata| {
            let rr = Record::from_rdata(owner.clone(), ttl, rdata);
            // Everything returned here must survive message encoding.
            rr.to_bytes()
                .map(|_| rr)
                .map_err(|e| format!("unencodable: {}", e))
        });
        match encoded {
            Ok(rr) => records.push(rr),
            Err(reason) => report_skip(&ResolveError::MalformedRecord {
                id: record.id.clone(),
                rtype: record_set.rtype.clone(),
                reason,
            }),
        }
    }
    Ok(records)
}

fn report_skip(err: &ResolveError) {
    log(LogLevel::Warn, &format!("Skipping record: {}", err));
}

fn parse_name(data: &str) -> Result<Name, String> {
    Name::from_str(data.trim()).map_err(|e| format!("bad name {:?}: {}", data, e))
}

fn priority(record: &StoredRecord) -> Result<u16, String> {
    let priority = record.effective_priority();
    u16::try_from(priority).map_err(|_| format!("priority {} out of range", priority))
}

fn encode_a(record: &StoredRecord) -> Result<RData, String> {
    record
        .data
        .trim()
        .parse::<Ipv4Addr>()
        .map(|ip| RData::A(A::from(ip)))
        .map_err(|e| format!("bad IPv4 address {:?}: {}", record.data, e))
}

fn encode_aaaa(record: &StoredRecord) -> Result<RData, String> {
    record
        .data
        .trim()
        .parse::<Ipv6Addr>()
        .map(|ip| RData::AAAA(AAAA::from(ip)))
        .map_err(|e| format!("bad IPv6 address {:?}: {}", record.data, e))
}

fn encode_cname(record: &StoredRecord) -> Result<RData, String> {
    parse_name(&record.data).map(|name| RData::CNAME(CNAME(name)))
}

fn encode_ns(record: &StoredRecord) -> Result<RData, String> {
    parse_name(&record.data).map(|name| RData::NS(NS(name)))
}

fn encode_mx(record: &StoredRecord) -> Result<RData, String> {
    let exchange = parse_name(&record.data)?;
    Ok(RData::MX(MX::new(priority(record)?, exchange)))
}

fn encode_srv(record: &StoredRecord) -> Result<RData, String> {
    let srv = Srv::decode(&record.data)?;
    let target = parse_name(&srv.target)?;
    Ok(RData::SRV(SRV::new(
        priority(record)?,
        srv.weight,
        srv.port,
        target,
    )))
}

fn encode_soa(record: &StoredRecord) -> Result<RData, String> {
    let soa = Soa::decode(&record.data)?;
    Ok(RData::SOA(SOA::new(
        parse_name(&soa.ns)?,
        parse_name(&soa.mbox)?,
        soa.serial,
        soa.refresh as i32,
        soa.retry as i32,
        soa.expire as i32,
        soa.minttl,
    )))
}

/// Longer payloads are split into consecutive 255-byte character-strings.
fn encode_txt(record: &StoredRecord) -> Result<RData, String> {
    let bytes = record.data.as_bytes();
    if bytes.is_empty() {
        return Ok(RData::TXT(TXT::new(vec![String::new()])));
    }
    Ok(RData::TXT(TXT::from_bytes(
        bytes.chunks(TXT_STRING_MAX).collect(),
    )))
}
