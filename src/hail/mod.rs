//! Escalations from a running phase to a human.
//!
//! Non-blocking hails are announcements. A blocking hail suspends the phase
//! until someone responds, the hail is dismissed, or the phase is cancelled.

use crate::errors::HailError;
use crate::events::{EventSink, NebulaEvent};
use crate::phase::PhaseId;
use crate::signals::Discovery;
use anyhow::Result;
use dialoguer::{Input, theme::ColorfulTheme};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

struct PendingHail {
    discovery: Discovery,
    tx: oneshot::Sender<String>,
}

pub struct HailChannel {
    pending: Mutex<BTreeMap<PhaseId, PendingHail>>,
    sink: Arc<dyn EventSink>,
}

impl HailChannel {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            pending: Mutex::new(BTreeMap::new()),
            sink,
        }
    }

    fn hails(&self) -> std::sync::MutexGuard<'_, BTreeMap<PhaseId, PendingHail>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Announce a discovery without waiting for an answer.
    pub fn hail(&self, phase: &PhaseId, discovery: Discovery) {
        tracing::info!(phase = %phase, kind = %discovery.kind, "hail raised");
        self.sink.emit(NebulaEvent::HailRaised {
            phase: phase.clone(),
            discovery,
            blocking: false,
        });
    }

    /// Raise a blocking hail and wait for the human's answer.
    pub async fn hail_and_wait(
        &self,
        cancel: &CancellationToken,
        phase: &PhaseId,
        discovery: Discovery,
    ) -> Result<String, HailError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut hails = self.hails();
            if hails.contains_key(phase) {
                return Err(HailError::AlreadyPending {
                    phase: phase.to_string(),
                });
            }
            hails.insert(
                phase.clone(),
                PendingHail {
                    discovery: discovery.clone(),
                    tx,
                },
            );
        }

        tracing::info!(phase = %phase, kind = %discovery.kind, "blocking hail raised");
        self.sink.emit(NebulaEvent::HailRaised {
            phase: phase.clone(),
            discovery,
            blocking: true,
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.hails().remove(phase);
                Err(HailError::Cancelled)
            }
            answer = rx => answer.map_err(|_| HailError::Dismissed),
        }
    }

    /// Answer the pending blocking hail of a phase.
    pub fn respond(&self, phase: &PhaseId, response: &str) -> Result<(), HailError> {
        let hail = self.hails().remove(phase).ok_or_else(|| HailError::NotPending {
            phase: phase.to_string(),
        })?;
        let _ = hail.tx.send(response.to_string());
        self.sink.emit(NebulaEvent::HailAnswered {
            phase: phase.clone(),
            response: response.to_string(),
        });
        Ok(())
    }

    /// Drop a pending hail; the waiting phase gets `HailError::Dismissed`.
    pub fn dismiss(&self, phase: &PhaseId) -> bool {
        self.hails().remove(phase).is_some()
    }

    /// Outstanding blocking hails.
    pub fn pending(&self) -> Vec<(PhaseId, Discovery)> {
        self.hails()
            .iter()
            .map(|(id, h)| (id.clone(), h.discovery.clone()))
            .collect()
    }
}

/// Ask the user to answer a hail. An empty answer means dismiss.
pub fn prompt_hail(phase: &PhaseId, discovery: &Discovery) -> Result<Option<String>> {
    println!();
    println!(
        "  {} {} {}",
        console::style("Hail from").yellow().bold(),
        console::style(phase).cyan(),
        console::style(format!("({})", discovery.kind)).dim()
    );
    println!("  {}", discovery.detail);

    let answer: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Answer (empty to dismiss)")
        .allow_empty(true)
        .interact_text()?;

    let answer = answer.trim();
    Ok((!answer.is_empty()).then(|| answer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullSink, RecordingSink};
    use crate::signals::DiscoveryKind;
    use std::time::Duration;

    fn ambiguity() -> Discovery {
        Discovery::new(DiscoveryKind::Ambiguity, "which database?")
    }

    #[test]
    fn test_fire_and_forget_emits_event() {
        let sink = Arc::new(RecordingSink::new());
        let hails = HailChannel::new(sink.clone());
        hails.hail(&"auth".into(), Discovery::new(DiscoveryKind::Note, "fyi"));

        assert!(hails.pending().is_empty());
        assert!(matches!(
            sink.events()[0],
            NebulaEvent::HailRaised {
                blocking: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_respond_unblocks_waiter() {
        let hails = Arc::new(HailChannel::new(Arc::new(NullSink)));
        let cancel = CancellationToken::new();

        let waiter = {
            let hails = hails.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                hails
                    .hail_and_wait(&cancel, &"auth".into(), ambiguity())
                    .await
            })
        };

        while hails.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        hails.respond(&"auth".into(), "postgres").unwrap();

        assert_eq!(waiter.await.unwrap(), Ok("postgres".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_returns_cancelled() {
        let hails = HailChannel::new(Arc::new(NullSink));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = hails
            .hail_and_wait(&cancel, &"auth".into(), ambiguity())
            .await;
        assert_eq!(result, Err(HailError::Cancelled));
        assert!(hails.pending().is_empty());
    }

    #[tokio::test]
    async fn test_dismiss_returns_dismissed() {
        let hails = Arc::new(HailChannel::new(Arc::new(NullSink)));
        let cancel = CancellationToken::new();

        let waiter = {
            let hails = hails.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                hails
                    .hail_and_wait(&cancel, &"auth".into(), ambiguity())
                    .await
            })
        };
        while hails.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(hails.dismiss(&"auth".into()));

        assert_eq!(waiter.await.unwrap(), Err(HailError::Dismissed));
    }

    #[tokio::test]
    async fn test_second_blocking_hail_rejected() {
        let hails = Arc::new(HailChannel::new(Arc::new(NullSink)));
        let cancel = CancellationToken::new();

        let _waiter = {
            let hails = hails.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                hails
                    .hail_and_wait(&cancel, &"auth".into(), ambiguity())
                    .await
            })
        };
        while hails.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = hails
            .hail_and_wait(&cancel, &"auth".into(), ambiguity())
            .await;
        assert_eq!(
            second,
            Err(HailError::AlreadyPending {
                phase: "auth".into()
            })
        );
        cancel.cancel();
    }

    #[test]
    fn test_respond_without_hail_errors() {
        let hails = HailChannel::new(Arc::new(NullSink));
        assert!(matches!(
            hails.respond(&"x".into(), "hi"),
            Err(HailError::NotPending { .. })
        ));
    }
}
