//! JSON-RPC over HTTP.
//!
//! A unit becomes one request:
//!
//! - `POST {base}/{path}?{params}` with a JSON-RPC 2.0 array body;
//! - `GET {base}/{path}?json_rpc_request=[..]&rid=..&{params}` when the unit
//!   ends in an image command, whose response body is the image;
//! - a single `render_loop_execute` call for render-loop states, polled for
//!   results when anyone is waiting on them.
//!
//! Prefix commands carry string ids (`prefix-N`) so their responses can
//! never be mistaken for a batch command's.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use url::form_urlencoded::byte_serialize;
use url::Url;

use prism_core::{Binary, Command, CommandError, RenderLoopTarget, Response, State, Value};

use crate::batch::SplitLimits;
use crate::config::ClientConfig;
use crate::connector::{BatchPolicy, Connector, UnitOutcome, WireItem, WireUnit};
use crate::error::TransportError;
use crate::poller::{PollAborter, PollStatus, ResultPoller};

/// Room reserved for an `"id":N` member when measuring.
const ID_RESERVE: usize = 32;
/// `?json_rpc_request=`, brackets, `&rid=` and a 32 digit request id.
const GET_OVERHEAD: usize = 64;

fn escaped_len(text: &str) -> usize {
    byte_serialize(text.as_bytes()).map(str::len).sum()
}

fn rpc_request(command: &Command, id: Option<serde_json::Value>) -> Result<serde_json::Value, CommandError> {
    let mut request = json!({
        "jsonrpc": "2.0",
        "method": command.name(),
        "params": command.params_json()?,
    });
    if let (Some(id), Some(object)) = (id, request.as_object_mut()) {
        object.insert("id".to_string(), id);
    }
    Ok(request)
}

fn prefix_id(index: usize) -> serde_json::Value {
    json!(format!("prefix-{index}"))
}

/// JSON-RPC array for a unit: prefix commands first, then the batch.
fn request_body(state: &State, items: &[WireItem]) -> Result<Vec<serde_json::Value>, CommandError> {
    let mut body = Vec::with_capacity(state.prefix().len() + items.len());
    for (index, command) in state.prefix().iter().enumerate() {
        body.push(rpc_request(command, Some(prefix_id(index)))?);
    }
    for item in items {
        body.push(rpc_request(&item.command, item.id.map(|id| json!(id)))?);
    }
    Ok(body)
}

fn error_from_json(error: serde_json::Value) -> CommandError {
    CommandError::from_value(&Value::from(error))
}

fn response_from_json(mut entry: serde_json::Value) -> Response {
    match entry.get_mut("error").map(serde_json::Value::take) {
        Some(error) if !error.is_null() => Err(error_from_json(error)),
        _ => Ok(entry
            .get_mut("result")
            .map(serde_json::Value::take)
            .map(Value::from)
            .unwrap_or(Value::Null)),
    }
}

/// Matches a JSON-RPC response body to the unit's items.
fn correlate(items: &[WireItem], body: serde_json::Value) -> Result<UnitOutcome, TransportError> {
    let entries = match body {
        serde_json::Value::Array(entries) => entries,
        serde_json::Value::Object(mut object) => {
            // A lone error object answers the whole request.
            return match object.remove("error") {
                Some(error) => Ok(UnitOutcome::Failed(error_from_json(error))),
                None => Err(CommandError::connection("unexpected JSON-RPC response object").into()),
            };
        }
        _ => return Err(CommandError::connection("JSON-RPC response is not an array").into()),
    };

    let mut by_id: HashMap<u64, Response> = HashMap::with_capacity(entries.len());
    for entry in entries {
        match entry.get("id").cloned() {
            Some(serde_json::Value::Number(n)) => {
                if let Some(id) = n.as_u64() {
                    by_id.insert(id, response_from_json(entry));
                }
            }
            Some(serde_json::Value::String(prefix)) => {
                if let Err(error) = response_from_json(entry) {
                    log::warn!("state command {prefix} failed: {error}");
                }
            }
            _ => {}
        }
    }

    let responses = items
        .iter()
        .map(|item| match item.id {
            Some(id) => by_id
                .remove(&id)
                .unwrap_or_else(|| Err(CommandError::missing_response())),
            None => Ok(Value::Null),
        })
        .collect();
    Ok(UnitOutcome::Delivered(responses))
}

fn render_loop_execute(target: &RenderLoopTarget, items: &[&WireItem], want_response: bool) -> Command {
    let commands: Vec<Value> = items.iter().map(|item| item.command.to_value()).collect();
    Command::new("render_loop_execute")
        .param("render_loop_name", target.name.as_str())
        .param("commands", commands)
        .param("cancel", target.cancel.to_wire())
        .param("continue_on_error", target.continue_on_error)
        .param("want_response", want_response)
}

/// Shared switch for the poll currently awaited by the connector.
#[derive(Debug, Clone, Default)]
pub struct PollControl {
    current: Arc<Mutex<Option<PollAborter>>>,
}

impl PollControl {
    /// Aborts the poll in progress, if any. Its callbacks are not invoked.
    pub fn abort(&self) -> bool {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match current {
            Some(aborter) => {
                aborter.abort();
                true
            }
            None => false,
        }
    }

    fn set(&self, aborter: Option<PollAborter>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = aborter;
    }
}

#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    base_url: Url,
    limits: SplitLimits,
    poller: ResultPoller,
    polls: PollControl,
}

impl HttpConnector {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: Url::parse(&config.base_url)?,
            limits: SplitLimits {
                max_len: config.max_batch_len,
            },
            poller: ResultPoller::new(config.poll_delay()),
            polls: PollControl::default(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn poll_control(&self) -> PollControl {
        self.polls.clone()
    }

    fn endpoint(&self, state: &State, leading: &[(&str, &str)]) -> Url {
        let mut url = self.base_url.clone();
        if !state.path().is_empty() {
            let path = format!("{}/{}", url.path().trim_end_matches('/'), state.path());
            url.set_path(&path);
        }
        if !leading.is_empty() || !state.url_params().is_empty() {
            let mut query = url.query_pairs_mut();
            query.extend_pairs(leading.iter().copied());
            query.extend_pairs(state.url_params());
        }
        url
    }

    async fn post_json(&self, url: Url, body: &[serde_json::Value]) -> Result<serde_json::Value, TransportError> {
        Ok(post_rpc(&self.client, url, body).await?)
    }

    async fn post(&self, unit: &WireUnit) -> Result<UnitOutcome, TransportError> {
        let body = request_body(&unit.state, &unit.items)?;
        let url = self.endpoint(&unit.state, &[]);
        log::debug!("POST {} ({} commands)", url.path(), unit.items.len());
        let response = self.post_json(url, &body).await?;
        correlate(&unit.items, response)
    }

    async fn fetch_image(&self, unit: &WireUnit) -> Result<UnitOutcome, TransportError> {
        let body = request_body(&unit.state, &unit.items)?;
        let request = serde_json::to_string(&body)?;
        let rid = uuid::Uuid::new_v4().simple().to_string();
        let url = self.endpoint(&unit.state, &[("json_rpc_request", &request), ("rid", &rid)]);
        log::debug!("GET {} ({} commands, image)", url.path(), unit.items.len());

        let response = self.client.get(url).send().await?.error_for_status()?;
        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response.bytes().await?;

        let last = unit.items.len().saturating_sub(1);
        let image: Response = if mime.starts_with("application/json") {
            // The server reports a failed render as a JSON-RPC error.
            let answer: serde_json::Value = serde_json::from_slice(&bytes)?;
            let error = match answer {
                serde_json::Value::Array(entries) => entries
                    .into_iter()
                    .map(response_from_json)
                    .find_map(Result::err),
                other => response_from_json(other).err(),
            };
            Err(error.unwrap_or_else(CommandError::missing_response))
        } else {
            Ok(Value::Binary(Binary::new(mime, bytes.to_vec())))
        };

        let mut responses: Vec<Response> = (0..last).map(|_| Ok(Value::Null)).collect();
        responses.push(image);
        Ok(UnitOutcome::Delivered(responses))
    }

    async fn execute_on_render_loop(
        &self,
        unit: &WireUnit,
        target: &RenderLoopTarget,
    ) -> Result<UnitOutcome, TransportError> {
        let calls: Vec<&WireItem> = unit.items.iter().filter(|item| !item.render).collect();
        let want_response = calls.iter().any(|item| item.id.is_some());
        let execute = WireItem {
            command: render_loop_execute(target, &calls, want_response),
            id: want_response.then_some(0),
            render: false,
        };
        let body = request_body(&unit.state, std::slice::from_ref(&execute))?;
        let url = self.endpoint(&unit.state, &[]);
        log::debug!(
            "render_loop_execute on {} ({} commands)",
            target.name,
            calls.len()
        );
        let answer = self.post_json(url.clone(), &body).await?;

        let sub_results = if want_response {
            let execute_id = match correlate(std::slice::from_ref(&execute), answer)? {
                UnitOutcome::Delivered(mut results) => match results.pop() {
                    Some(Ok(value)) => value
                        .get("execute_id")
                        .cloned()
                        .ok_or_else(|| CommandError::connection("render_loop_execute returned no execute_id"))?,
                    Some(Err(error)) => return Ok(UnitOutcome::Failed(error)),
                    None => return Ok(UnitOutcome::Failed(CommandError::missing_response())),
                },
                other => return Ok(other),
            };
            match self.poll_results(url, execute_id).await {
                Some(Ok(results)) => results,
                Some(Err(error)) => return Ok(UnitOutcome::Failed(error)),
                None => return Ok(UnitOutcome::Suppressed),
            }
        } else {
            Vec::new()
        };

        let mut sub_results = sub_results.into_iter();
        let responses = unit
            .items
            .iter()
            .map(|item| {
                if item.render {
                    return Err(CommandError::encode(
                        "image commands cannot run inside a render-loop execute",
                    ));
                }
                let result = sub_results.next();
                match item.id {
                    Some(_) => result.unwrap_or_else(|| Err(CommandError::missing_response())),
                    None => Ok(Value::Null),
                }
            })
            .collect();
        Ok(UnitOutcome::Delivered(responses))
    }

    async fn poll_results(
        &self,
        url: Url,
        execute_id: Value,
    ) -> Option<Result<Vec<Response>, CommandError>> {
        let client = self.client.clone();
        let fetch = move || poll_once(client.clone(), url.clone(), execute_id.clone());
        let polls = self.polls.clone();
        let outcome = self.poller.run(fetch, |aborter| polls.set(Some(aborter))).await;
        self.polls.set(None);
        outcome
    }
}

async fn post_rpc(
    client: &reqwest::Client,
    url: Url,
    body: &[serde_json::Value],
) -> Result<serde_json::Value, reqwest::Error> {
    client.post(url).json(body).send().await?.error_for_status()?.json().await
}

async fn poll_once(client: reqwest::Client, url: Url, execute_id: Value) -> Result<PollStatus, CommandError> {
    let poll = Command::new("render_loop_get_execute_results").param("execute_id", execute_id);
    let body = [rpc_request(&poll, Some(json!("poll")))?];
    let answer = post_rpc(&client, url, &body)
        .await
        .map_err(|e| CommandError::connection(e.to_string()))?;
    let entry = match answer {
        serde_json::Value::Array(mut entries) if !entries.is_empty() => entries.swap_remove(0),
        other => other,
    };
    let status = response_from_json(entry)?;
    Ok(PollStatus::from_value(&status))
}

impl BatchPolicy for HttpConnector {
    fn measure(&self, command: &Command) -> Result<usize, CommandError> {
        let request = rpc_request(command, None)?;
        let text = serde_json::to_string(&request).map_err(|e| CommandError::encode(e.to_string()))?;
        Ok(escaped_len(&text) + ID_RESERVE + 1)
    }

    fn state_overhead(&self, state: &State) -> usize {
        let url = self.endpoint(state, &[]);
        let prefix: usize = state
            .prefix()
            .iter()
            .filter_map(|command| self.measure(command).ok())
            .sum();
        url.as_str().len() + GET_OVERHEAD + prefix
    }

    fn limits(&self) -> SplitLimits {
        self.limits
    }
}

impl Connector for HttpConnector {
    async fn send(&mut self, unit: WireUnit) -> UnitOutcome {
        let result = match unit.state.render_loop_target() {
            Some(target) => self.execute_on_render_loop(&unit, target).await,
            None if unit.ends_with_render() => self.fetch_image(&unit).await,
            None => self.post(&unit).await,
        };
        result.unwrap_or_else(|error| {
            log::error!("HTTP unit of {} commands failed: {error}", unit.items.len());
            UnitOutcome::Failed(error.to_command_error())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::CancelMode;

    fn item(name: &str, id: Option<u64>) -> WireItem {
        WireItem {
            command: Command::new(name),
            id,
            render: false,
        }
    }

    fn connector() -> HttpConnector {
        HttpConnector::new(&ClientConfig {
            base_url: "http://render.local:8080/api/".to_string(),
            ..ClientConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_request_body_prefix_ids() {
        let state = State::session().with_prefix(Command::new("use_scope").param("scope_name", "s1"));
        let body = request_body(&state, &[item("a", Some(1)), item("b", None)]).unwrap();
        assert_eq!(body[0]["id"], json!("prefix-0"));
        assert_eq!(body[0]["method"], json!("use_scope"));
        assert_eq!(body[1]["id"], json!(1));
        assert!(body[2].get("id").is_none());
        assert_eq!(body[2]["jsonrpc"], json!("2.0"));
    }

    #[test]
    fn test_correlate_by_id_ignores_prefix() {
        let items = [item("a", Some(1)), item("b", None), item("c", Some(2))];
        let body = json!([
            {"jsonrpc": "2.0", "id": "prefix-0", "result": null},
            {"jsonrpc": "2.0", "id": 2, "error": {"code": -32601, "message": "Method not found"}},
            {"jsonrpc": "2.0", "id": 1, "result": {"ok": true}},
        ]);
        match correlate(&items, body).unwrap() {
            UnitOutcome::Delivered(responses) => {
                assert_eq!(responses[0], Ok(Value::map().with("ok", true)));
                assert_eq!(responses[1], Ok(Value::Null));
                assert_eq!(responses[2].as_ref().unwrap_err().code, -32601);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_correlate_missing_and_whole_request_errors() {
        let items = [item("a", Some(7))];
        match correlate(&items, json!([])).unwrap() {
            UnitOutcome::Delivered(responses) => {
                assert_eq!(
                    responses[0].as_ref().unwrap_err().code,
                    prism_core::error::MISSING_RESPONSE
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        let lone = json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}});
        assert!(matches!(
            correlate(&items, lone).unwrap(),
            UnitOutcome::Failed(CommandError { code: -32700, .. })
        ));
        assert!(correlate(&items, json!("nope")).is_err());
    }

    #[test]
    fn test_endpoint_joins_path_and_params() {
        let http = connector();
        let state = State::session()
            .with_path("/scene/")
            .with_url_param("scope", "a b");
        assert_eq!(
            http.endpoint(&state, &[]).as_str(),
            "http://render.local:8080/api/scene?scope=a+b"
        );
        let url = http.endpoint(&state, &[("json_rpc_request", "[{}]"), ("rid", "x")]);
        assert_eq!(url.query(), Some("json_rpc_request=%5B%7B%7D%5D&rid=x&scope=a+b"));
        assert_eq!(
            http.endpoint(&State::session(), &[]).as_str(),
            "http://render.local:8080/api/"
        );
    }

    #[test]
    fn test_measure_counts_escaping() {
        let http = connector();
        let short = http.measure(&Command::new("a")).unwrap();
        let escaped = http.measure(&Command::new("a").param("s", "{}{}{}")).unwrap();
        assert!(escaped > short + 6 * 3);
        assert!(http
            .measure(&Command::new("upload").param("data", Value::bytes(vec![1u8])))
            .is_err());
    }

    #[test]
    fn test_prefix_counts_toward_overhead() {
        let http = connector();
        let plain = http.state_overhead(&State::session());
        let scoped = http.state_overhead(&State::session().with_prefix(Command::new("use_scope")));
        assert!(scoped > plain);
    }

    #[test]
    fn test_render_loop_execute_params() {
        let target = RenderLoopTarget {
            name: "main".into(),
            cancel: CancelMode::Hard,
            continue_on_error: true,
        };
        let a = item("camera_set_resolution", Some(1));
        let command = render_loop_execute(&target, &[&a], true);
        assert_eq!(command.name(), "render_loop_execute");
        assert_eq!(command.params()["render_loop_name"], Value::from("main"));
        assert_eq!(command.params()["cancel"], Value::from(1));
        assert_eq!(command.params()["want_response"], Value::Bool(true));
        assert_eq!(command.params()["commands"].as_array().unwrap().len(), 1);
    }
}
