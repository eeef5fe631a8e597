//! HTTP adapter: GET/POST routes onto the method registry.
//!
//! Paths are matched lowercase against the registered route tables;
//! query-string pairs become the handler's keyed arguments. Responses are a
//! JSON document `{state, result, error}` with the wire state encoding
//! (0 failed, 1 success).

use axum::Json;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::debug;

use crate::AppState;
use crate::registry::Dicts;

pub async fn handle(state: &AppState, method: &Method, uri: &Uri) -> Response {
    let path = uri.path().to_lowercase();
    let route = if *method == Method::GET {
        state.registry.get_route(&path)
    } else if *method == Method::POST {
        state.registry.post_route(&path)
    } else {
        return envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            0,
            Value::Null,
            "method not allowed by the server",
        );
    };

    let Some(route) = route else {
        debug!(%path, "no route");
        return envelope(StatusCode::BAD_REQUEST, 0, Value::Null, "not found");
    };

    let dicts = parse_query(uri.query().unwrap_or(""));
    match route.call(vec![], dicts).await {
        Ok(result) => envelope(StatusCode::OK, 1, result, ""),
        Err(error) => envelope(StatusCode::UNPROCESSABLE_ENTITY, 0, Value::Null, &error),
    }
}

fn envelope(status: StatusCode, state: u8, result: Value, error: &str) -> Response {
    (
        status,
        Json(json!({ "state": state, "result": result, "error": error })),
    )
        .into_response()
}

/// `a=1&b=two` → `{"a": "1", "b": "two"}`; pairs without `=` are dropped.
fn parse_query(query: &str) -> Dicts {
    let mut dicts = Dicts::new();
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            dicts.insert(
                key.trim().to_owned(),
                Value::String(value.trim().to_owned()),
            );
        }
    }
    dicts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_become_keyed_arguments() {
        let dicts = parse_query("a=1&b= two &broken&c=x=y");
        assert_eq!(dicts.get("a"), Some(&Value::String("1".to_owned())));
        assert_eq!(dicts.get("b"), Some(&Value::String("two".to_owned())));
        assert_eq!(dicts.get("c"), Some(&Value::String("x=y".to_owned())));
        assert!(!dicts.contains_key("broken"));
    }
}
