//! Fixed-record `Lookup` implementation for evaluator tests.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;

use postern_dns::{DnsError, Lookup, MxRecord};

#[derive(Debug, Default)]
pub struct StubLookup {
    txt: HashMap<String, Vec<String>>,
    a: HashMap<String, Vec<Ipv4Addr>>,
    aaaa: HashMap<String, Vec<Ipv6Addr>>,
    mx: HashMap<String, Vec<MxRecord>>,
    fail: bool,
}

impl StubLookup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn txt(mut self, name: &str, value: &str) -> Self {
        self.txt
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    #[must_use]
    pub fn a(mut self, name: &str, ip: &str) -> Self {
        self.a
            .entry(name.to_string())
            .or_default()
            .push(ip.parse().unwrap());
        self
    }

    #[must_use]
    pub fn mx(mut self, name: &str, preference: u16, exchange: &str) -> Self {
        self.mx.entry(name.to_string()).or_default().push(MxRecord {
            preference,
            exchange: exchange.to_string(),
        });
        self
    }

    /// Every lookup returns a transient failure.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn check(&self) -> Result<(), DnsError> {
        if self.fail {
            Err(DnsError::Timeout("stub".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Lookup for StubLookup {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.check()?;
        Ok(self.txt.get(name).cloned().unwrap_or_default())
    }

    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        self.check()?;
        Ok(self.a.get(name).cloned().unwrap_or_default())
    }

    async fn aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        self.check()?;
        Ok(self.aaaa.get(name).cloned().unwrap_or_default())
    }

    async fn mx(&self, name: &str) -> Result<Vec<MxRecord>, DnsError> {
        self.check()?;
        Ok(self.mx.get(name).cloned().unwrap_or_default())
    }
}
