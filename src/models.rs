/* src/models.rs */

use serde::Serialize;

/// One authoritative domain as stored in the `domains` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    /// Admin contact in `user@domain` form.
    pub email: String,
    pub ttl: u32,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// Every record answering one (name, type) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSet {
    pub id: String,
    pub domain_id: String,
    pub name: String,
    /// Textual RR type, e.g. "A" or "MX".
    pub rtype: String,
    /// `None` inherits the owning zone's TTL.
    pub ttl: Option<u32>,
    pub records: Vec<StoredRecord>,
}

/// A single row of the `records` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRecord {
    pub id: String,
    pub domain_id: String,
    pub recordset_id: String,
    pub data: String,
    /// Only meaningful for MX and SRV.
    pub priority: Option<i64>,
    pub hash: String,
}

impl StoredRecord {
    /// Priority used for ordering and encoding; absent means 0.
    pub fn effective_priority(&self) -> i64 {
        self.priority.unwrap_or(0)
    }
}

/// Decoded SOA payload: `ns mbox serial refresh retry expire minttl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Soa {
    pub ns: String,
    pub mbox: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minttl: u32,
}

impl Soa {
    /// Splits the stored payload. Numeric fields that fail to parse become 0.
    pub fn decode(data: &str) -> Result<Self, String> {
        let fields: Vec<&str> = data.split_whitespace().collect();
        if fields.len() != 7 {
            return Err(format!("expected 7 SOA fields, got {}", fields.len()));
        }
        let lenient = |s: &str| s.parse::<u32>().unwrap_or(0);
        Ok(Self {
            ns: fields[0].to_string(),
            mbox: fields[1].to_string(),
            serial: lenient(fields[2]),
            refresh: lenient(fields[3]),
            retry: lenient(fields[4]),
            expire: lenient(fields[5]),
            minttl: lenient(fields[6]),
        })
    }
}

/// Decoded SRV payload: `weight port target`. Priority lives on the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Srv {
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

impl Srv {
    pub fn decode(data: &str) -> Result<Self, String> {
        let fields: Vec<&str> = data.split_whitespace().collect();
        let [weight, port, target] = fields.as_slice() else {
            return Err(format!("expected 3 SRV fields, got {}", fields.len()));
        };
        let weight = weight
            .parse::<u16>()
            .map_err(|e| format!("bad weight {weight:?}: {e}"))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("bad port {port:?}: {e}"))?;
        Ok(Self {
            weight,
            port,
            target: target.to_string(),
        })
    }
}

/// RFC 1035 mailbox form of an admin address: `admin@example.com` -> `admin.example.com.`
pub fn mailbox_from_email(email: &str) -> String {
    format!("{}.", email.replace('@', "."))
}
