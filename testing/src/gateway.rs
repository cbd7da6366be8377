use rentflow_core::ports::{CaptureStatus, GatewayError, GatewayOrder, PaymentGateway};
use rentflow_core::types::{GatewayToken, Money, PayerId, ReservationId};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Payment gateway double.
///
/// Orders get tokens `MOCK-1`, `MOCK-2`, ... Captures succeed unless a scripted
/// result was queued with [`script_capture`](Self::script_capture).
#[derive(Debug, Clone, Default)]
pub struct MockPaymentGateway {
    orders: Arc<AtomicUsize>,
    captures: Arc<Mutex<Vec<(GatewayToken, PayerId)>>>,
    scripted_captures: Arc<Mutex<VecDeque<Result<CaptureStatus, GatewayError>>>>,
    failing_orders: Arc<Mutex<Option<GatewayError>>>,
}

impl MockPaymentGateway {
    /// Gateway that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next capture call.
    pub fn script_capture(&self, result: Result<CaptureStatus, GatewayError>) {
        self.scripted_captures.lock().unwrap().push_back(result);
    }

    /// Make every order creation fail with `error`.
    pub fn fail_orders(&self, error: GatewayError) {
        *self.failing_orders.lock().unwrap() = Some(error);
    }

    /// Capture calls received, in order.
    #[must_use]
    pub fn captures(&self) -> Vec<(GatewayToken, PayerId)> {
        self.captures.lock().unwrap().clone()
    }

    /// Orders created so far.
    #[must_use]
    pub fn orders_created(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn create_order(
        &self,
        _amount: Money,
        _reservation: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayOrder, GatewayError>> + Send + '_>> {
        let result = match self.failing_orders.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => {
                let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
                let token = GatewayToken::new(format!("MOCK-{n}"));
                Ok(GatewayOrder {
                    approval_url: format!("https://gateway.test/checkoutnow?token={token}"),
                    token,
                })
            },
        };
        Box::pin(async move { result })
    }

    fn capture_order<'a>(
        &'a self,
        token: &'a GatewayToken,
        payer: &'a PayerId,
    ) -> Pin<Box<dyn Future<Output = Result<CaptureStatus, GatewayError>> + Send + 'a>> {
        self.captures
            .lock()
            .unwrap()
            .push((token.clone(), payer.clone()));
        let result = self
            .scripted_captures
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(CaptureStatus::Completed));
        Box::pin(async move { result })
    }
}
