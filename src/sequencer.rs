//! Mutation Sequencer
//!
//! A single task owns every mutating operation on the tree: commands
//! arrive through a bounded queue and are applied strictly in order, so
//! writes are linearisable without any locking in the core. Each command
//! carries a one-shot response channel; replies never block, so a caller
//! that gave up on its timeout cannot stall the sequencer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::common::{KtError, Result};
use crate::crypto::Hash;
use crate::prefix_tree::AuditorUpdate;
use crate::transparency::TransparencyLog;
use crate::wire::UpdateValue;

/// One write request: labels to add values under, labels to remove.
pub struct MutateRequest {
    pub adds: Vec<(Vec<u8>, UpdateValue)>,
    pub removes: Vec<Vec<u8>>,
}

/// What the caller gets back once its mutation committed.
#[derive(Debug)]
pub struct MutateReceipt {
    pub tree_size: u64,
    pub root: Hash,
    pub auditor: AuditorUpdate,
}

enum Command {
    Mutate {
        request: MutateRequest,
        resp: oneshot::Sender<Result<MutateReceipt>>,
    },
}

/// Cheap handle for submitting commands to the sequencer task.
#[derive(Clone)]
pub struct SequencerHandle {
    tx: mpsc::Sender<Command>,
}

impl SequencerHandle {
    /// Submit a mutation and wait for it to commit, up to `timeout`.
    pub async fn mutate(
        &self,
        request: MutateRequest,
        timeout: Duration,
    ) -> Result<MutateReceipt> {
        let (resp, rx) = oneshot::channel();
        let submit = async {
            self.tx
                .send(Command::Mutate { request, resp })
                .await
                .map_err(|_| unavailable("sequencer is gone"))?;
            rx.await.map_err(|_| unavailable("sequencer dropped the request"))?
        };
        tokio::time::timeout(timeout, submit)
            .await
            .map_err(|_| unavailable("sequencer timed out"))?
    }
}

fn unavailable(msg: &str) -> KtError {
    KtError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, msg))
}

/// Spawn the sequencer task over the (sole) writing reference to the log.
pub fn spawn(log: Arc<TransparencyLog>, queue_depth: usize) -> SequencerHandle {
    let (tx, rx) = mpsc::channel(queue_depth);
    tokio::spawn(run(log, rx));
    SequencerHandle { tx }
}

async fn run(log: Arc<TransparencyLog>, mut rx: mpsc::Receiver<Command>) {
    info!(target: "ktlog::sequencer", "sequencer started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Mutate { request, resp } => {
                let result = log
                    .mutate(&request.adds, &request.removes)
                    .await
                    .map(|outcome| MutateReceipt {
                        tree_size: outcome.tree_size,
                        root: outcome.root,
                        auditor: outcome.auditor,
                    });
                if resp.send(result).is_err() {
                    // The caller timed out; the mutation is committed
                    // regardless and the next reader will observe it.
                    warn!(target: "ktlog::sequencer", "caller went away before the reply");
                }
            }
        }
    }
    info!(target: "ktlog::sequencer", "sequencer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SigningKeyPair, VrfPrivateKey};
    use crate::storage::memory::MemoryStore;
    use crate::wire::{DeploymentMode, PublicConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_log() -> Arc<TransparencyLog> {
        let signing = SigningKeyPair::from_seed(&[1u8; 32]);
        let vrf = VrfPrivateKey::from_seed(&[2u8; 32]);
        let config = PublicConfig {
            suite_id: 1,
            mode: DeploymentMode::ContactMonitoring,
            signature_public_key: signing.public_key_bytes().to_vec(),
            vrf_public_key: vrf.public_key().to_bytes().to_vec(),
            max_ahead: 60_000,
            max_behind: 3_600_000,
            reasonable_monitoring_window: 86_400_000,
            maximum_lifetime: None,
        };
        Arc::new(
            TransparencyLog::new(
                config,
                signing,
                vrf,
                Box::new(MemoryStore::new()),
                Box::new(StdRng::seed_from_u64(3)),
                Box::new(|| 1_700_000_000_000),
            )
            .unwrap(),
        )
    }

    fn request(label: &[u8], value: &[u8]) -> MutateRequest {
        MutateRequest {
            adds: vec![(
                label.to_vec(),
                UpdateValue {
                    prefix: None,
                    value: value.to_vec(),
                },
            )],
            removes: vec![],
        }
    }

    #[tokio::test]
    async fn test_mutations_are_sequenced() {
        let log = test_log();
        let handle = spawn(log.clone(), 16);

        let mut receipts = Vec::new();
        for i in 0..5u8 {
            let receipt = handle
                .mutate(request(b"alice", &[i]), Duration::from_secs(5))
                .await
                .unwrap();
            receipts.push(receipt.tree_size);
        }
        assert_eq!(receipts, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.tree_head().await.unwrap().unwrap().tree_size, 5);
    }

    #[tokio::test]
    async fn test_error_reply_keeps_sequencer_alive() {
        let log = test_log();
        let handle = spawn(log.clone(), 16);

        let err = handle
            .mutate(
                MutateRequest {
                    adds: vec![],
                    removes: vec![b"ghost".to_vec()],
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KtError::BadRequest(_)));

        handle
            .mutate(request(b"alice", b"v0"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(log.tree_head().await.unwrap().unwrap().tree_size, 1);
    }
}
