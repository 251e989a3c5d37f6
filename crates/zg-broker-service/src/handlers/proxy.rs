//! Metering front-end.
//!
//! Every billable request is metered before it reaches the model server:
//!
//! 1. the metering headers must be complete and well-formed
//! 2. the path must be an allow-listed route under the service prefix
//! 3. the declared fees must cover the measured input
//! 4. the user must hold a ledger account whose locked balance covers the
//!    fee on top of everything not yet settled
//! 5. a `Pending` usage record is stored, which enforces the nonce order
//!
//! The request is then forwarded. A delivered response has its output
//! measured and recorded; a failed one discards the record so it is never
//! billed.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Uri};
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use zg_broker_core::{AccountAddress, NewUsage, SettlementPair, UsageRecord};

use crate::error::ApiError;
use crate::extractor::{ExtractError, ReqRespExtractor};
use crate::state::AppState;
use crate::upstream::{UpstreamRequest, UpstreamResponse};

const EVENT_STREAM: &str = "text/event-stream";

/// Meter a billable request and forward it upstream.
pub async fn forward(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let metadata = state.validator.validate(&headers)?;
    let (route, extractor) = state
        .registry
        .lookup(uri.path())
        .ok_or_else(|| ApiError::NotFound(format!("no billable route at {}", uri.path())))?;

    let input_count = extractor.input_count(&body)?;
    metadata.check_fees(input_count, state.config.input_price)?;
    check_balance(&state, metadata.address, metadata.fee).await?;

    let record = UsageRecord::new(NewUsage {
        user: metadata.address,
        provider: state.provider,
        route: route.to_string(),
        service_name: metadata.service_name,
        input_count,
        input_fee: metadata.input_fee,
        previous_output_fee: metadata.previous_output_fee,
        fee: metadata.fee,
        nonce: metadata.nonce,
        request_hash: metadata.request_hash,
        signature: metadata.signature,
    });
    state.store.insert_usage(&record).await?;

    tracing::debug!(
        id = %record.id,
        user = %record.user,
        nonce = record.nonce,
        input_count,
        "Metered request"
    );

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request = UpstreamRequest {
        route: route.to_string(),
        content_type,
        body: body.to_vec(),
    };

    let response = match state.upstream.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            discard(&state, &record, "upstream unreachable").await;
            return Err(e.into());
        }
    };

    if !response.status.is_success() {
        discard(&state, &record, "upstream returned an error").await;
        return Ok(relay(response));
    }

    let output_count = match measure_output(extractor, &response) {
        Ok(count) => count,
        Err(e) => {
            discard(&state, &record, "response could not be measured").await;
            return Err(ApiError::ExternalService(format!(
                "unreadable upstream response: {e}"
            )));
        }
    };
    let output_fee = u128::from(output_count).saturating_mul(state.config.output_price);

    // The response is relayed even if bookkeeping fails; the record then
    // stays undelivered and is never billed.
    if let Err(e) = state
        .store
        .record_delivery(&record.id, output_count, output_fee, Utc::now())
        .await
    {
        tracing::error!(id = %record.id, error = %e, "Failed to record delivery");
    }

    Ok(relay(response))
}

/// Reject the request unless `user` can pay `fee` on top of its unsettled
/// usage with this provider.
async fn check_balance(state: &AppState, user: AccountAddress, fee: u128) -> Result<(), ApiError> {
    let pair = SettlementPair {
        user,
        provider: state.provider,
    };
    let unsettled = state.store.unsettled_fee(&pair).await?;
    let required = fee.saturating_add(unsettled);
    let covers = |balance: u128| required <= balance;

    let account = state.ledger.get_user_account(&user).await?;
    if covers(account.balance) {
        return Ok(());
    }

    // A cached balance may predate a deposit.
    let account = state.ledger.refresh_user_account(&user).await?;
    if covers(account.balance) {
        return Ok(());
    }

    tracing::info!(
        user = %user,
        fee = %fee,
        unsettled = %unsettled,
        balance = %account.balance,
        "Refusing request over balance"
    );
    Err(ApiError::InsufficientBalance {
        balance: account.balance,
        required,
    })
}

/// Count the billable output of a delivered response.
///
/// Event streams are measured line by line up to the end-of-stream marker.
fn measure_output(
    extractor: &dyn ReqRespExtractor,
    response: &UpstreamResponse,
) -> Result<u64, ExtractError> {
    let content = extractor.response_content(&response.body, response.content_encoding.as_deref())?;

    let streamed = response
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with(EVENT_STREAM));
    if !streamed {
        return extractor.output_count(&[&content]);
    }

    let mut chunks: Vec<&[u8]> = Vec::new();
    for line in content.split(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        chunks.push(line);
        if extractor.stream_completed(line)? {
            break;
        }
    }
    extractor.output_count(&chunks)
}

async fn discard(state: &AppState, record: &UsageRecord, reason: &str) {
    match state.store.soft_delete(&record.id, Utc::now()).await {
        Ok(()) => tracing::warn!(
            id = %record.id,
            user = %record.user,
            nonce = record.nonce,
            reason,
            "Usage record discarded"
        ),
        Err(e) => tracing::error!(id = %record.id, error = %e, "Failed to discard usage record"),
    }
}

fn relay(response: UpstreamResponse) -> Response {
    let mut out = (response.status, response.body).into_response();
    let headers = out.headers_mut();
    if let Some(value) = response
        .content_type
        .and_then(|v| HeaderValue::from_str(&v).ok())
    {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Some(value) = response
        .content_encoding
        .and_then(|v| HeaderValue::from_str(&v).ok())
    {
        headers.insert(CONTENT_ENCODING, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ChatCompletions;
    use axum::http::StatusCode;

    fn response(content_type: &str, body: &str) -> UpstreamResponse {
        UpstreamResponse {
            status: StatusCode::OK,
            content_type: Some(content_type.into()),
            content_encoding: None,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn event_stream_stops_at_done() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"hello there\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"friend\"},\"finish_reason\":\"stop\"}]}\n\n\
                    data: [DONE]\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"ignored words\"}}]}\n";
        let count = measure_output(&ChatCompletions, &response("text/event-stream", body)).unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn json_body_is_measured_whole() {
        let body = "{\n  \"choices\": [\n    {\"message\": {\"content\": \"one two three four\"}}\n  ]\n}";
        let count = measure_output(&ChatCompletions, &response("application/json", body)).unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn relay_keeps_content_headers() {
        let relayed = relay(UpstreamResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            content_type: Some("application/json".into()),
            content_encoding: Some("gzip".into()),
            body: Vec::new(),
        });
        assert_eq!(relayed.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(relayed.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(relayed.headers()[CONTENT_ENCODING], "gzip");
    }
}
