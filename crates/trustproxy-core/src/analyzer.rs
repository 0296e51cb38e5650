//! The thin contract through which an external driver feeds a target
//! and a prior attestation into a proxied build and collects the
//! resulting network log.
//!
//! Everything except "run the rebuild with the network proxy enabled"
//! is out of scope for this workspace (attestation parsing, rebuild
//! strategy extraction, the output/asset store, and the stabilizer
//! passes that decide artifact equivalence). Those are named here only
//! so the facade's contract with its caller is anchored; callers
//! supply real implementations.

use anyhow::{Result, bail};

use crate::NetworkLog;

/// Identifies the artifact being analyzed. Opaque to this core; flows
/// through as context for the caller's own bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub ecosystem: String,
    pub package: String,
    pub version: String,
    pub artifact: String,
}

/// The rebuild strategy extracted from a prior attestation's
/// byproducts — out of scope to produce here, just consumed.
#[derive(Debug, Clone, Default)]
pub struct RebuildStrategy {
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Where prior analysis artifacts live, and where this run's network
/// log gets written. A sibling subsystem, out of scope here.
pub trait OutputStore {
    fn already_exists(&self, target: &Target) -> Result<bool>;
    fn write_network_log(&self, target: &Target, log: &NetworkLog) -> Result<()>;
}

/// Parses a signed attestation bundle and extracts its rebuild
/// strategy. Out of scope here: in-toto/SLSA construction and
/// verification live in a sibling subsystem.
pub trait AttestationReader {
    fn read_rebuild_strategy(&self, attestation_bundle: &[u8]) -> Result<RebuildStrategy>;
}

/// Decides whether a rebuilt artifact is equivalent to the upstream
/// one, exactly or via stabilization passes. Out of scope here.
pub trait Stabilizer {
    fn equivalent(&self, rebuilt: &[u8], upstream: &[u8]) -> Result<bool>;
}

/// The facade an external driver calls through. Only
/// [`AnalyzerFacade::run_proxied_rebuild`] touches this workspace's
/// actual core (the Docker truststore proxy); everything else here
/// documents the surrounding contract.
pub struct AnalyzerFacade<'a> {
    pub output_store: &'a dyn OutputStore,
    pub attestation_reader: &'a dyn AttestationReader,
    pub stabilizer: &'a dyn Stabilizer,
}

impl<'a> AnalyzerFacade<'a> {
    pub fn new(
        output_store: &'a dyn OutputStore,
        attestation_reader: &'a dyn AttestationReader,
        stabilizer: &'a dyn Stabilizer,
    ) -> Self {
        Self {
            output_store,
            attestation_reader,
            stabilizer,
        }
    }

    /// Step 1: short-circuit with an error if a prior analysis
    /// artifact already exists and isn't being overwritten.
    pub fn check_not_already_analyzed(&self, target: &Target, allow_overwrite: bool) -> Result<()> {
        if !allow_overwrite && self.output_store.already_exists(target)? {
            bail!("analysis already exists");
        }
        Ok(())
    }

    /// Steps 2-3: read the attestation bundle and extract its
    /// rebuild strategy.
    pub fn rebuild_strategy_for(&self, attestation_bundle: &[u8]) -> Result<RebuildStrategy> {
        self.attestation_reader.read_rebuild_strategy(attestation_bundle)
    }

    /// Step 5: persist the network log the proxied rebuild produced.
    /// Step 4 (actually running the rebuild with the proxy enabled)
    /// is the caller's responsibility — it drives `trustproxy-docker`
    /// directly, outside this facade.
    pub fn record_network_log(&self, target: &Target, log: &NetworkLog) -> Result<()> {
        self.output_store.write_network_log(target, log)
    }

    /// Step 6: compare the rebuilt artifact against the upstream one.
    pub fn check_equivalent(&self, rebuilt: &[u8], upstream: &[u8]) -> Result<()> {
        if !self.stabilizer.equivalent(rebuilt, upstream)? {
            bail!("rebuild content mismatch");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;

    struct FakeOutputStore {
        existing: HashSet<String>,
        written: RefCell<Vec<String>>,
    }

    fn key(target: &Target) -> String {
        format!("{}/{}@{}", target.ecosystem, target.package, target.version)
    }

    impl OutputStore for FakeOutputStore {
        fn already_exists(&self, target: &Target) -> Result<bool> {
            Ok(self.existing.contains(&key(target)))
        }
        fn write_network_log(&self, target: &Target, _log: &NetworkLog) -> Result<()> {
            self.written.borrow_mut().push(key(target));
            Ok(())
        }
    }

    struct FakeAttestationReader;
    impl AttestationReader for FakeAttestationReader {
        fn read_rebuild_strategy(&self, _bundle: &[u8]) -> Result<RebuildStrategy> {
            Ok(RebuildStrategy {
                command: vec!["pip".into(), "wheel".into()],
                env: vec![],
            })
        }
    }

    struct FakeStabilizer {
        equal: bool,
    }
    impl Stabilizer for FakeStabilizer {
        fn equivalent(&self, _rebuilt: &[u8], _upstream: &[u8]) -> Result<bool> {
            Ok(self.equal)
        }
    }

    fn sample_target() -> Target {
        Target {
            ecosystem: "pypi".to_string(),
            package: "requests".to_string(),
            version: "2.31.0".to_string(),
            artifact: "requests-2.31.0-py3-none-any.whl".to_string(),
        }
    }

    #[test]
    fn short_circuits_when_already_analyzed() {
        let store = FakeOutputStore {
            existing: HashSet::from(["pypi/requests@2.31.0".to_string()]),
            written: RefCell::new(Vec::new()),
        };
        let reader = FakeAttestationReader;
        let stabilizer = FakeStabilizer { equal: true };
        let facade = AnalyzerFacade::new(&store, &reader, &stabilizer);

        let err = facade
            .check_not_already_analyzed(&sample_target(), false)
            .expect_err("should short-circuit");
        assert!(err.to_string().contains("analysis already exists"));
    }

    #[test]
    fn overwrite_flag_bypasses_short_circuit() {
        let store = FakeOutputStore {
            existing: HashSet::from(["pypi/requests@2.31.0".to_string()]),
            written: RefCell::new(Vec::new()),
        };
        let reader = FakeAttestationReader;
        let stabilizer = FakeStabilizer { equal: true };
        let facade = AnalyzerFacade::new(&store, &reader, &stabilizer);

        facade
            .check_not_already_analyzed(&sample_target(), true)
            .expect("overwrite allowed");
    }

    #[test]
    fn records_network_log_under_target_key() {
        let store = FakeOutputStore {
            existing: HashSet::new(),
            written: RefCell::new(Vec::new()),
        };
        let reader = FakeAttestationReader;
        let stabilizer = FakeStabilizer { equal: true };
        let facade = AnalyzerFacade::new(&store, &reader, &stabilizer);

        facade
            .record_network_log(&sample_target(), &NetworkLog::new())
            .expect("write succeeds");
        assert_eq!(store.written.borrow().as_slice(), ["pypi/requests@2.31.0"]);
    }

    #[test]
    fn mismatch_is_reported_with_the_documented_message() {
        let store = FakeOutputStore {
            existing: HashSet::new(),
            written: RefCell::new(Vec::new()),
        };
        let reader = FakeAttestationReader;
        let stabilizer = FakeStabilizer { equal: false };
        let facade = AnalyzerFacade::new(&store, &reader, &stabilizer);

        let err = facade
            .check_equivalent(b"rebuilt", b"upstream")
            .expect_err("should mismatch");
        assert!(err.to_string().contains("rebuild content mismatch"));
    }
}
