use reqwest::Client;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::repository::table_service::list_rows;
use crate::services::lease_charges::value_str;

/// Reference to a stored payment method usable for off-session collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodRef {
    pub id: String,
    pub provider_method_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentDispatchStatus {
    Succeeded,
    RequiresAction,
    Processing,
    Failed,
}

impl PaymentDispatchStatus {
    fn from_provider(raw: &str) -> Self {
        match raw {
            "succeeded" => Self::Succeeded,
            "requires_action" | "requires_confirmation" => Self::RequiresAction,
            "processing" | "requires_capture" => Self::Processing,
            _ => Self::Failed,
        }
    }

    /// In-flight states count as processed; the final status lands later
    /// through the provider's asynchronous update channel.
    pub fn counts_as_processed(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct PaymentDispatch {
    pub status: PaymentDispatchStatus,
    pub provider_payment_id: Option<String>,
}

/// The payment collaborators this engine depends on. Resolver and
/// dispatcher errors are per-lease, best-effort failures — never structural.
pub trait PaymentGateway {
    fn find_best_payment_method(
        &self,
        charge: &Value,
    ) -> impl std::future::Future<Output = Result<Option<PaymentMethodRef>, String>> + Send;

    fn dispatch_payment(
        &self,
        charge_id: &str,
        method: &PaymentMethodRef,
        amount: f64,
        currency: &str,
    ) -> impl std::future::Future<Output = Result<PaymentDispatch, String>> + Send;
}

/// Outcome of one best-effort collection attempt for a freshly created
/// charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutopayOutcome {
    /// No stored payment method; the charge stays pending for manual
    /// collection. Not an error.
    NoMethod,
    /// Dispatch reached a terminal-success or in-flight state.
    Processed,
    /// Resolver or dispatcher failed; recorded against the charge.
    Failed(String),
}

pub async fn attempt_autopay<G: PaymentGateway>(gateway: &G, charge: &Value) -> AutopayOutcome {
    let charge_id = value_str(charge, "id");

    let method = match gateway.find_best_payment_method(charge).await {
        Ok(Some(method)) => method,
        Ok(None) => {
            tracing::debug!(charge_id, "No stored payment method, leaving charge pending");
            return AutopayOutcome::NoMethod;
        }
        Err(error) => return AutopayOutcome::Failed(error),
    };

    let amount = charge
        .as_object()
        .and_then(|obj| obj.get("amount"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let currency = {
        let raw = value_str(charge, "currency");
        if raw.is_empty() {
            "USD".to_string()
        } else {
            raw
        }
    };

    tracing::debug!(charge_id, payment_method = %method.id, "Dispatching payment");

    match gateway
        .dispatch_payment(&charge_id, &method, amount, &currency)
        .await
    {
        Ok(dispatch) if dispatch.status.counts_as_processed() => {
            tracing::debug!(
                charge_id,
                provider_payment_id = dispatch.provider_payment_id.as_deref().unwrap_or(""),
                "Payment dispatched"
            );
            AutopayOutcome::Processed
        }
        Ok(_) => AutopayOutcome::Failed("Payment attempt was declined.".to_string()),
        Err(error) => AutopayOutcome::Failed(error),
    }
}

/// Stripe-backed gateway: stored methods in `payment_methods`, dispatch via
/// off-session PaymentIntents.
#[derive(Clone)]
pub struct StripeAutopayGateway {
    pool: PgPool,
    http_client: Client,
    secret_key: Option<String>,
    enabled: bool,
}

impl StripeAutopayGateway {
    pub fn new(
        pool: PgPool,
        http_client: Client,
        secret_key: Option<String>,
        enabled: bool,
    ) -> Self {
        Self {
            pool,
            http_client,
            secret_key,
            enabled,
        }
    }
}

impl PaymentGateway for StripeAutopayGateway {
    async fn find_best_payment_method(
        &self,
        charge: &Value,
    ) -> Result<Option<PaymentMethodRef>, String> {
        if !self.enabled {
            tracing::debug!("Autopay is disabled, skipping payment method lookup");
            return Ok(None);
        }

        let lease_id = value_str(charge, "lease_id");
        if lease_id.is_empty() {
            return Ok(None);
        }

        let mut filters = serde_json::Map::new();
        filters.insert("lease_id".to_string(), Value::String(lease_id));
        filters.insert("is_active".to_string(), Value::Bool(true));

        let methods = list_rows(
            &self.pool,
            "payment_methods",
            Some(&filters),
            50,
            "created_at",
            false,
        )
        .await
        .map_err(|error| format!("Payment method lookup failed: {error}"))?;

        Ok(choose_best_method(&methods))
    }

    async fn dispatch_payment(
        &self,
        charge_id: &str,
        method: &PaymentMethodRef,
        amount: f64,
        currency: &str,
    ) -> Result<PaymentDispatch, String> {
        let secret_key = self
            .secret_key
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| "STRIPE_SECRET_KEY not configured".to_string())?;

        let currency_lower = currency.to_lowercase();
        let stripe_amount = amount_in_minor_units(amount, &currency_lower);

        let response = self
            .http_client
            .post("https://api.stripe.com/v1/payment_intents")
            .basic_auth(secret_key, None::<&str>)
            .form(&[
                ("amount", stripe_amount.to_string().as_str()),
                ("currency", currency_lower.as_str()),
                ("payment_method", method.provider_method_id.as_str()),
                ("confirm", "true"),
                ("off_session", "true"),
                ("metadata[charge_id]", charge_id),
            ])
            .send()
            .await
            .map_err(|error| {
                tracing::error!(%error, charge_id, "Stripe API request failed");
                "Stripe API request failed.".to_string()
            })?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or(json!({"error": "failed to parse response"}));

        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown Stripe error");
            return Err(format!("Stripe API error ({status}): {message}"));
        }

        let provider_status = body.get("status").and_then(Value::as_str).unwrap_or("");
        Ok(PaymentDispatch {
            status: PaymentDispatchStatus::from_provider(provider_status),
            provider_payment_id: body
                .get("id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        })
    }
}

/// Prefer the default method; otherwise the newest (rows arrive newest
/// first).
fn choose_best_method(methods: &[Value]) -> Option<PaymentMethodRef> {
    let to_ref = |row: &Value| {
        let id = value_str(row, "id");
        let provider_method_id = value_str(row, "provider_method_id");
        if id.is_empty() || provider_method_id.is_empty() {
            None
        } else {
            Some(PaymentMethodRef {
                id,
                provider_method_id,
            })
        }
    };

    methods
        .iter()
        .find(|row| {
            row.as_object()
                .and_then(|obj| obj.get("is_default"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
        .and_then(to_ref)
        .or_else(|| methods.iter().find_map(|row| to_ref(row)))
}

/// Stripe wants minor units, except for zero-decimal currencies.
fn amount_in_minor_units(amount: f64, currency_lower: &str) -> i64 {
    const ZERO_DECIMAL: &[&str] = &["pyg", "jpy", "krw", "vnd", "clp"];
    if ZERO_DECIMAL.contains(&currency_lower) {
        amount.round() as i64
    } else {
        (amount * 100.0).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{
        amount_in_minor_units, attempt_autopay, choose_best_method, AutopayOutcome,
        PaymentDispatch, PaymentDispatchStatus, PaymentGateway, PaymentMethodRef,
    };

    struct StubGateway {
        method: Option<PaymentMethodRef>,
        resolver_error: Option<String>,
        dispatch: Result<PaymentDispatch, String>,
    }

    impl PaymentGateway for StubGateway {
        async fn find_best_payment_method(
            &self,
            _charge: &Value,
        ) -> Result<Option<PaymentMethodRef>, String> {
            if let Some(error) = &self.resolver_error {
                return Err(error.clone());
            }
            Ok(self.method.clone())
        }

        async fn dispatch_payment(
            &self,
            _charge_id: &str,
            _method: &PaymentMethodRef,
            _amount: f64,
            _currency: &str,
        ) -> Result<PaymentDispatch, String> {
            self.dispatch.clone()
        }
    }

    fn method() -> PaymentMethodRef {
        PaymentMethodRef {
            id: "pm-row-1".to_string(),
            provider_method_id: "pm_123".to_string(),
        }
    }

    fn charge() -> Value {
        json!({"id": "charge-1", "lease_id": "lease-1", "amount": 1450.0, "currency": "USD"})
    }

    fn dispatch(status: PaymentDispatchStatus) -> Result<PaymentDispatch, String> {
        Ok(PaymentDispatch {
            status,
            provider_payment_id: Some("pi_123".to_string()),
        })
    }

    #[tokio::test]
    async fn no_stored_method_is_not_an_error() {
        let gateway = StubGateway {
            method: None,
            resolver_error: None,
            dispatch: dispatch(PaymentDispatchStatus::Succeeded),
        };
        assert_eq!(
            attempt_autopay(&gateway, &charge()).await,
            AutopayOutcome::NoMethod
        );
    }

    #[tokio::test]
    async fn in_flight_statuses_count_as_processed() {
        for status in [
            PaymentDispatchStatus::Succeeded,
            PaymentDispatchStatus::RequiresAction,
            PaymentDispatchStatus::Processing,
        ] {
            let gateway = StubGateway {
                method: Some(method()),
                resolver_error: None,
                dispatch: dispatch(status),
            };
            assert_eq!(
                attempt_autopay(&gateway, &charge()).await,
                AutopayOutcome::Processed
            );
        }
    }

    #[tokio::test]
    async fn declined_and_errored_dispatches_are_recorded_failures() {
        let declined = StubGateway {
            method: Some(method()),
            resolver_error: None,
            dispatch: dispatch(PaymentDispatchStatus::Failed),
        };
        assert!(matches!(
            attempt_autopay(&declined, &charge()).await,
            AutopayOutcome::Failed(_)
        ));

        let errored = StubGateway {
            method: Some(method()),
            resolver_error: None,
            dispatch: Err("card_declined".to_string()),
        };
        assert_eq!(
            attempt_autopay(&errored, &charge()).await,
            AutopayOutcome::Failed("card_declined".to_string())
        );
    }

    #[tokio::test]
    async fn resolver_errors_are_recorded_failures() {
        let gateway = StubGateway {
            method: None,
            resolver_error: Some("lookup timed out".to_string()),
            dispatch: dispatch(PaymentDispatchStatus::Succeeded),
        };
        assert_eq!(
            attempt_autopay(&gateway, &charge()).await,
            AutopayOutcome::Failed("lookup timed out".to_string())
        );
    }

    #[test]
    fn prefers_default_method_over_newer_ones() {
        let rows = vec![
            json!({"id": "pm-row-2", "provider_method_id": "pm_new", "is_default": false}),
            json!({"id": "pm-row-1", "provider_method_id": "pm_default", "is_default": true}),
        ];
        let best = choose_best_method(&rows).expect("a method");
        assert_eq!(best.provider_method_id, "pm_default");

        let no_default = vec![
            json!({"id": "pm-row-2", "provider_method_id": "pm_new"}),
            json!({"id": "pm-row-1", "provider_method_id": "pm_old"}),
        ];
        let best = choose_best_method(&no_default).expect("a method");
        assert_eq!(best.provider_method_id, "pm_new");

        assert!(choose_best_method(&[]).is_none());
    }

    #[test]
    fn maps_provider_statuses() {
        assert_eq!(
            PaymentDispatchStatus::from_provider("succeeded"),
            PaymentDispatchStatus::Succeeded
        );
        assert_eq!(
            PaymentDispatchStatus::from_provider("requires_action"),
            PaymentDispatchStatus::RequiresAction
        );
        assert_eq!(
            PaymentDispatchStatus::from_provider("processing"),
            PaymentDispatchStatus::Processing
        );
        assert_eq!(
            PaymentDispatchStatus::from_provider("canceled"),
            PaymentDispatchStatus::Failed
        );
        assert!(!PaymentDispatchStatus::Failed.counts_as_processed());
    }

    #[test]
    fn converts_amounts_to_minor_units() {
        assert_eq!(amount_in_minor_units(1450.0, "usd"), 145000);
        assert_eq!(amount_in_minor_units(10.505, "usd"), 1051);
        assert_eq!(amount_in_minor_units(2500000.0, "pyg"), 2500000);
    }
}
