//! In-process provider clients for tests and local runs.
//!
//! No network access: outcomes are configured per provider up front and every
//! built or executed probe is counted so callers can assert on dispatch.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use provisioning_common::ProviderType;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::aws::Ec2InstanceTypeInfo;
use crate::instance_types::InstanceTypeSource;
use crate::sources::Authentication;
use crate::{ProbeFactory, StatusProbe};

#[derive(Debug, Clone)]
pub enum MockOutcome {
    Healthy,
    /// The probe is built but its call fails with this message.
    Failing(String),
    /// The client cannot be constructed.
    InitFailure(String),
}

#[derive(Default)]
pub struct MockProbeFactory {
    outcomes: HashMap<ProviderType, MockOutcome>,
    built: AtomicUsize,
    runs: Arc<AtomicUsize>,
}

impl MockProbeFactory {
    /// Every provider answers healthy unless overridden.
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, provider: ProviderType, outcome: MockOutcome) -> Self {
        self.outcomes.insert(provider, outcome);
        self
    }

    pub fn probes_built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    pub fn probes_run(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeFactory for MockProbeFactory {
    async fn probe(&self, auth: &Authentication) -> Result<Box<dyn StatusProbe>> {
        let outcome = self
            .outcomes
            .get(&auth.provider)
            .cloned()
            .unwrap_or(MockOutcome::Healthy);
        let failure = match outcome {
            MockOutcome::InitFailure(msg) => return Err(anyhow!("{}", msg)),
            MockOutcome::Failing(msg) => Some(msg),
            MockOutcome::Healthy => None,
        };
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockProbe {
            provider: auth.provider,
            failure,
            runs: Arc::clone(&self.runs),
        }))
    }
}

struct MockProbe {
    provider: ProviderType,
    failure: Option<String>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl StatusProbe for MockProbe {
    fn provider(&self) -> ProviderType {
        self.provider
    }

    async fn status(&self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(msg) => Err(anyhow!("{}", msg)),
            None => Ok(()),
        }
    }
}

/// Fixed EC2-shaped instance type catalog.
pub struct MockInstanceTypes {
    items: Vec<Ec2InstanceTypeInfo>,
    failure: Option<String>,
    fetches: AtomicUsize,
}

impl MockInstanceTypes {
    pub fn new(items: Vec<Ec2InstanceTypeInfo>) -> Self {
        Self {
            items,
            failure: None,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing(msg: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            failure: Some(msg.into()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceTypeSource for MockInstanceTypes {
    type Native = Ec2InstanceTypeInfo;

    fn provider(&self) -> ProviderType {
        ProviderType::Aws
    }

    async fn fetch_instance_types(&self) -> Result<Vec<Ec2InstanceTypeInfo>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(msg) => Err(anyhow!("{}", msg)),
            None => Ok(self.items.clone()),
        }
    }
}
