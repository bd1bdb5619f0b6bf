//! HTTP-facing intake: validate a request and enqueue a work item for the worker.

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::{
    model::{CITY_REQUIRED, HttpResponse, WorkItem},
    sink::{MessageId, MessageQueue},
};

const CORS_HEADERS: &[(&str, &str)] = &[
    ("Content-Type", "application/json"),
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

const USAGE: &str = r#"send { "city": "CityName" }"#;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Text(String),
    Json(Value),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntakeRequest {
    pub method: String,
    pub body: RequestBody,
}

impl IntakeRequest {
    pub fn post(body: RequestBody) -> Self {
        Self {
            method: "POST".to_string(),
            body,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Accepted<'a> {
    message: &'static str,
    message_id: &'a MessageId,
    ciudad: &'a str,
    status: &'static str,
}

fn reply(status_code: u16, body: &impl Serialize) -> HttpResponse {
    HttpResponse::json(status_code, body)
        .unwrap_or_else(|_| HttpResponse::internal_error())
        .with_headers(CORS_HEADERS)
}

fn bad_request(error: &str) -> HttpResponse {
    reply(400, &json!({ "error": error, "message": USAGE }))
}

/// Handle one intake request. Only the city is forwarded; any simulate flag is dropped.
pub async fn handle_intake(request: &IntakeRequest, queue: &dyn MessageQueue) -> HttpResponse {
    if request.method.eq_ignore_ascii_case("OPTIONS") {
        return reply(200, &json!({ "message": "OK" }));
    }

    let body = match &request.body {
        RequestBody::Json(value) => value.clone(),
        RequestBody::Empty => json!({}),
        RequestBody::Text(text) if text.trim().is_empty() => json!({}),
        RequestBody::Text(text) => match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "intake body is not valid JSON");
                return bad_request("request body must be valid JSON");
            }
        },
    };

    let item = WorkItem::from_value(&body);
    let Ok(city) = item.validated_city() else {
        warn!("intake request without a city");
        return bad_request(CITY_REQUIRED);
    };

    match queue.send(json!({ "city": city }).to_string()).await {
        Ok(message_id) => {
            info!(city, %message_id, "work item enqueued");
            reply(
                202,
                &Accepted {
                    message: "request accepted and processing",
                    message_id: &message_id,
                    ciudad: city,
                    status: "processing",
                },
            )
        }
        Err(err) => {
            error!(city, error = %err, "failed to enqueue work item");
            let body = json!({
                "error": "internal server error",
                "details": err.to_string(),
            });
            reply(500, &body)
        }
    }
}
