//! Backend Selector
//!
//! Binds exactly one inference backend for the lifetime of the process.
//! Probes run once, in fidelity order, on first use; the first probe that
//! comes up wins. If none does the selector stays `Failed` and every later
//! call gets `NoBackendAvailable` without probing again.
//!
//! Probing runs in its own task so a caller that gives up halfway (client
//! disconnect) cannot cancel it and cause a second round of probes.

use crate::error::{PipelineError, Result};
use crate::inference::{BackendKind, BackendProbe, InferenceBackend};
use crate::metrics;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "backend", rename_all = "lowercase")]
pub enum SelectorState {
    Unbound,
    Probing,
    Bound(BackendKind),
    Failed,
}

type ProbeOutcome = Shared<BoxFuture<'static, Option<Arc<dyn InferenceBackend>>>>;

pub struct BackendSelector {
    probes: Arc<Vec<Arc<dyn BackendProbe>>>,
    state: Arc<RwLock<SelectorState>>,
    outcome: OnceLock<ProbeOutcome>,
}

impl BackendSelector {
    /// Probes are reordered into [`BackendKind::FALLBACK_ORDER`]
    pub fn new(mut probes: Vec<Arc<dyn BackendProbe>>) -> Self {
        probes.sort_by_key(|p| fallback_rank(p.kind()));
        Self {
            probes: Arc::new(probes),
            state: Arc::new(RwLock::new(SelectorState::Unbound)),
            outcome: OnceLock::new(),
        }
    }

    pub fn state(&self) -> SelectorState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bound_kind(&self) -> Option<BackendKind> {
        match self.state() {
            SelectorState::Bound(kind) => Some(kind),
            _ => None,
        }
    }

    /// The bound backend, probing on first call
    pub async fn backend(&self) -> Result<Arc<dyn InferenceBackend>> {
        let outcome = self
            .outcome
            .get_or_init(|| {
                let probes = self.probes.clone();
                let state = self.state.clone();
                let handle = tokio::spawn(probe_chain(probes, state.clone()));
                async move {
                    match handle.await {
                        Ok(bound) => bound,
                        Err(e) => {
                            error!(error = %e, "Backend probing task failed");
                            set_state(&state, SelectorState::Failed);
                            None
                        }
                    }
                }
                .boxed()
                .shared()
            })
            .clone();

        outcome.await.ok_or(PipelineError::NoBackendAvailable)
    }
}

fn fallback_rank(kind: BackendKind) -> usize {
    BackendKind::FALLBACK_ORDER
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(BackendKind::FALLBACK_ORDER.len())
}

fn set_state(state: &RwLock<SelectorState>, next: SelectorState) {
    *state.write().unwrap_or_else(PoisonError::into_inner) = next;
}

async fn probe_chain(
    probes: Arc<Vec<Arc<dyn BackendProbe>>>,
    state: Arc<RwLock<SelectorState>>,
) -> Option<Arc<dyn InferenceBackend>> {
    set_state(&state, SelectorState::Probing);

    for probe in probes.iter() {
        let kind = probe.kind();
        match probe.init().await {
            Ok(backend) => {
                metrics::BACKEND_PROBES
                    .with_label_values(&[kind.as_str(), "bound"])
                    .inc();
                info!(backend = %kind, "Inference backend bound");
                set_state(&state, SelectorState::Bound(kind));
                return Some(backend);
            }
            Err(e) => {
                metrics::BACKEND_PROBES
                    .with_label_values(&[kind.as_str(), "unavailable"])
                    .inc();
                warn!(backend = %kind, reason = %e.reason, "Backend probe failed, falling back");
            }
        }
    }

    error!(probed = probes.len(), "Every inference backend failed to initialise");
    set_state(&state, SelectorState::Failed);
    None
}
