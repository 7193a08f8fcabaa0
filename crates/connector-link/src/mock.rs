use crate::Link;
use async_trait::async_trait;
use connector_errors::LinkError;
use connector_packet::{ErrorCode, FulfillBuilder, Prepare, RejectBuilder};
use connector_service::IlpResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// An in-process link for tests: responds from a closure and records every
/// packet sent through it.
#[derive(Clone)]
pub struct MockLink {
    handler: Arc<dyn Fn(&Prepare) -> IlpResult + Send + Sync>,
    connected: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<Prepare>>>,
}

impl MockLink {
    pub fn new(handler: impl Fn(&Prepare) -> IlpResult + Send + Sync + 'static) -> Self {
        MockLink {
            handler: Arc::new(handler),
            connected: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A link whose first `failures` sends are unreachable rejects and whose
    /// later sends fulfill with a zeroed fulfillment.
    pub fn failing_then_succeeding(failures: usize) -> Self {
        let counter = AtomicUsize::new(0);
        MockLink::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < failures {
                Err(RejectBuilder {
                    code: ErrorCode::T01_PEER_UNREACHABLE,
                    message: b"link down",
                    triggered_by: None,
                    data: &[],
                }
                .build())
            } else {
                Ok(FulfillBuilder {
                    fulfillment: &[0; 32],
                    data: &[],
                }
                .build())
            }
        })
    }

    /// The packets sent over this link so far, in order.
    pub fn sent_packets(&self) -> Vec<Prepare> {
        self.sent.lock().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl Link for MockLink {
    async fn connect(&self) -> Result<(), LinkError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_packet(&self, prepare: Prepare) -> IlpResult {
        self.sent.lock().push(prepare.clone());
        (self.handler)(&prepare)
    }
}
