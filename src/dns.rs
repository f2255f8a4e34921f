//! DNS record backend used for ACME DNS-01 challenges

use crate::error::DnsError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Ns,
    Txt,
    Caa,
}

/// One resource record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub value: String,
    #[serde(default)]
    pub ttl: Option<u32>,
    /// Replace every existing record of the same name and type
    #[serde(default)]
    pub unique: bool,
}

impl DnsRecord {
    pub fn txt(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            record_type: RecordType::Txt,
            value: value.into(),
            ttl: None,
            unique: false,
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    fn same_slot(&self, name: &str, record_type: RecordType) -> bool {
        self.record_type == record_type && self.name.eq_ignore_ascii_case(name)
    }
}

/// Zone storage the certificate manager publishes challenge records into
pub trait DnsBackend: Send + Sync {
    fn record(&self, record: DnsRecord) -> Result<(), DnsError>;

    /// Remove the record matching `record`'s name, type and value
    fn delete(&self, record: &DnsRecord) -> Result<(), DnsError>;
}

/// In-process record table
#[derive(Debug, Default)]
pub struct MemoryDns {
    records: RwLock<Vec<DnsRecord>>,
}

impl MemoryDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str, record_type: RecordType) -> Vec<DnsRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.same_slot(name, record_type))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl DnsBackend for MemoryDns {
    fn record(&self, record: DnsRecord) -> Result<(), DnsError> {
        let name = record.name.trim().trim_end_matches('.');
        if name.is_empty() {
            return Err(DnsError::InvalidName(record.name));
        }
        let record = DnsRecord {
            name: name.to_lowercase(),
            ..record
        };

        let mut records = self.records.write();
        if record.unique {
            records.retain(|r| !r.same_slot(&record.name, record.record_type));
        } else if records.contains(&record) {
            return Ok(());
        }
        debug!(name = %record.name, record_type = ?record.record_type, "DNS record added");
        records.push(record);
        Ok(())
    }

    fn delete(&self, record: &DnsRecord) -> Result<(), DnsError> {
        let name = record.name.trim().trim_end_matches('.');
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| !(r.same_slot(name, record.record_type) && r.value == record.value));
        if records.len() != before {
            debug!(name, record_type = ?record.record_type, "DNS record removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_record_replaces_existing() {
        let dns = MemoryDns::new();
        let name = "_acme-challenge.example.com";

        dns.record(DnsRecord::txt(name, "first").with_ttl(100).unique()).unwrap();
        dns.record(DnsRecord::txt(name, "second").with_ttl(100).unique()).unwrap();

        let found = dns.lookup(name, RecordType::Txt);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "second");
        assert_eq!(found[0].ttl, Some(100));
    }

    #[test]
    fn test_non_unique_records_accumulate() {
        let dns = MemoryDns::new();
        dns.record(DnsRecord::txt("example.com", "a")).unwrap();
        dns.record(DnsRecord::txt("EXAMPLE.com.", "b")).unwrap();
        dns.record(DnsRecord::txt("example.com", "b")).unwrap();
        assert_eq!(dns.lookup("example.com", RecordType::Txt).len(), 2);
    }

    #[test]
    fn test_delete_removes_exact_record() {
        let dns = MemoryDns::new();
        dns.record(DnsRecord::txt("example.com", "keep")).unwrap();
        dns.record(DnsRecord::txt("example.com", "drop")).unwrap();

        dns.delete(&DnsRecord::txt("example.com", "drop")).unwrap();
        let left = dns.lookup("example.com", RecordType::Txt);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].value, "keep");
    }

    #[test]
    fn test_rejects_empty_name() {
        let dns = MemoryDns::new();
        assert!(dns.record(DnsRecord::txt(" . ", "x")).is_err());
        assert!(dns.is_empty());
    }

    #[test]
    fn test_record_serializes_type_field() {
        let json = serde_json::to_value(DnsRecord::txt("a.com", "v")).unwrap();
        assert_eq!(json["type"], "TXT");
    }
}
