//! The HTTP API simulators use to drive the orchestrator.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::libhive::backend::{labels, ContainerOptions};
use crate::libhive::data::{ClientInfo, HiveInstance, SuiteId, TestId, TestResult};
use crate::libhive::enode::EnodeUrl;
use crate::libhive::errors::{HiveError, HiveResult};
use crate::libhive::testmanager::{RunMetadata, TestManager};

/// The variables forwarded into client containers.
const HIVE_ENV_PREFIX: &str = "HIVE_";

/// Maximum size of a client start request, bounding genesis and chain
/// data uploads.
const MAX_NODE_REQUEST: usize = 256 * 1024 * 1024;

/// Builds the simulation API router.
pub fn router(manager: Arc<TestManager>) -> Router {
    Router::new()
        .route("/hive", get(hive_info))
        .route("/clients", get(client_types))
        .route("/testsuite", post(start_suite))
        .route("/testsuite/:suite", delete(end_suite))
        .route("/testsuite/:suite/test", post(start_test))
        .route("/testsuite/:suite/test/:test", post(end_test))
        .route("/testsuite/:suite/test/:test/node", post(start_client))
        .route(
            "/testsuite/:suite/test/:test/node/:node",
            get(node_info).delete(stop_client),
        )
        .route(
            "/testsuite/:suite/test/:test/node/:node/pause",
            post(pause_client).delete(unpause_client),
        )
        .route("/testsuite/:suite/test/:test/node/:node/exec", post(exec_in_client))
        .route(
            "/testsuite/:suite/network/:network",
            post(network_create).delete(network_remove),
        )
        .route(
            "/testsuite/:suite/network/:network/:node",
            get(network_ip).post(network_connect).delete(network_disconnect),
        )
        .layer(DefaultBodyLimit::max(MAX_NODE_REQUEST))
        .with_state(manager)
}

/// Error responses carry a JSON `{"error": ...}` body with a status code
/// chosen by error category.
struct ApiError(HiveError);

impl From<HiveError> for ApiError {
    fn from(err: HiveError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            // 404 is reserved for node and network lookups; out-of-order
            // suite and test calls are bad requests.
            HiveError::NoSuchNode | HiveError::NetworkNotFound => StatusCode::NOT_FOUND,
            err if err.is_lifecycle() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn ok() -> Json<&'static str> {
    Json("OK")
}

/// Suite/test metadata arrives either as JSON or as an urlencoded form.
fn parse_meta(headers: &HeaderMap, body: &Bytes) -> HiveResult<RunMetadata> {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if is_form {
        serde_urlencoded::from_bytes(body)
            .map_err(|err| HiveError::BadRequest(format!("invalid form data: {err}")))
    } else {
        serde_json::from_slice(body)
            .map_err(|err| HiveError::BadRequest(format!("invalid JSON body: {err}")))
    }
}

fn require_suite(manager: &TestManager, suite: SuiteId) -> HiveResult<()> {
    if !manager.is_suite_running(suite) {
        return Err(HiveError::NoSuchTestSuite);
    }
    Ok(())
}

fn require_test(manager: &TestManager, suite: SuiteId, test: TestId) -> HiveResult<()> {
    require_suite(manager, suite)?;
    if !manager.is_test_running(suite, test) {
        return Err(HiveError::NoSuchTestCase);
    }
    Ok(())
}

async fn hive_info() -> Json<HiveInstance> {
    info!("API: hive info requested");
    Json(HiveInstance::current())
}

async fn client_types(
    State(manager): State<Arc<TestManager>>,
) -> Json<Vec<crate::libhive::data::ClientDefinition>> {
    Json(manager.client_definitions().to_vec())
}

async fn start_suite(
    State(manager): State<Arc<TestManager>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<SuiteId>> {
    let meta = parse_meta(&headers, &body)?;
    let name = meta.name.clone();
    let id = manager.start_suite(meta);
    info!(suite = id, %name, "API: suite started");
    Ok(Json(id))
}

async fn end_suite(
    State(manager): State<Arc<TestManager>>,
    Path(suite): Path<SuiteId>,
) -> ApiResult<Json<&'static str>> {
    manager.end_suite(suite).await?;
    info!(suite, "API: suite ended");
    Ok(ok())
}

async fn start_test(
    State(manager): State<Arc<TestManager>>,
    Path(suite): Path<SuiteId>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<TestId>> {
    let meta = parse_meta(&headers, &body)?;
    let name = meta.name.clone();
    let id = manager.start_test(suite, meta)?;
    info!(suite, test = id, %name, "API: test started");
    Ok(Json(id))
}

/// The end-test request body. The summary may be given under a
/// `summaryResult` key with optional per-client results, or as a bare
/// result object.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndTestPayload {
    #[serde(default)]
    summary_result: Option<TestResult>,
    #[serde(default)]
    client_results: Option<BTreeMap<String, TestResult>>,
}

async fn end_test(
    State(manager): State<Arc<TestManager>>,
    Path((suite, test)): Path<(SuiteId, TestId)>,
    body: Bytes,
) -> ApiResult<Json<&'static str>> {
    let payload: EndTestPayload = serde_json::from_slice(&body).unwrap_or_default();
    let (summary, client_results) = match payload.summary_result {
        Some(summary) => (summary, payload.client_results),
        None => match serde_json::from_slice::<TestResult>(&body) {
            Ok(summary) => (summary, None),
            Err(_) => return Err(HiveError::NoSummaryResult.into()),
        },
    };
    let pass = summary.pass;
    manager.end_test(suite, test, summary, client_results).await?;
    info!(suite, test, pass, "API: test ended");
    Ok(ok())
}

/// Parameters extracted from a client start request.
#[derive(Default)]
struct NodeRequest {
    client: Option<String>,
    shared: bool,
    env: HashMap<String, String>,
    files: HashMap<String, Vec<u8>>,
}

impl NodeRequest {
    async fn from_multipart(mut form: Multipart) -> HiveResult<NodeRequest> {
        let mut req = NodeRequest::default();
        while let Some(field) = form.next_field().await.map_err(bad_multipart)? {
            let name = field.name().unwrap_or_default().to_string();
            if field.file_name().is_some() {
                // The field name, not the supplied filename, is the
                // destination path. RFC 7578 filenames may carry directory
                // components that must not be trusted.
                let content = field.bytes().await.map_err(bad_multipart)?;
                req.files.insert(name, content.to_vec());
                continue;
            }
            let value = field.text().await.map_err(bad_multipart)?;
            match name.as_str() {
                "CLIENT" => req.client = Some(value),
                "SHARED" => req.shared = value == "true",
                _ if name.starts_with(HIVE_ENV_PREFIX) => {
                    req.env.insert(name, value);
                }
                _ => {}
            }
        }
        Ok(req)
    }
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> HiveError {
    HiveError::BadRequest(format!("could not parse node request: {err}"))
}

#[derive(Debug, Serialize)]
struct StartNodeResponse {
    id: String,
    ip: String,
}

async fn start_client(
    State(manager): State<Arc<TestManager>>,
    Path((suite, test)): Path<(SuiteId, TestId)>,
    form: Multipart,
) -> ApiResult<Json<StartNodeResponse>> {
    let mut req = NodeRequest::from_multipart(form).await?;
    if req.shared {
        require_suite(&manager, suite)?;
    } else {
        require_test(&manager, suite, test)?;
    }

    let client_name = req.client.take().ok_or(HiveError::MissingClient)?;
    let def = manager
        .client_definition(&client_name)
        .ok_or_else(|| HiveError::UnknownClient(client_name.clone()))?
        .clone();

    req.env
        .entry("HIVE_LOGLEVEL".to_string())
        .or_insert_with(|| manager.env().sim_log_level.to_string());
    let check_live = match req.env.get("HIVE_CHECK_LIVE_PORT") {
        None => 8545,
        Some(v) => v.parse::<u16>().map_err(|_| {
            HiveError::BadRequest(format!("invalid HIVE_CHECK_LIVE_PORT value {v:?}"))
        })?,
    };

    let mut container_labels = labels::base(manager.instance_id());
    container_labels.insert(labels::TYPE.into(), labels::TYPE_CLIENT.into());
    container_labels.insert(labels::TEST_SUITE.into(), suite.to_string());
    container_labels.insert(labels::TEST_CASE.into(), test.to_string());
    container_labels.insert(labels::CLIENT_NAME.into(), def.name.clone());

    let mut opts = ContainerOptions {
        env: req.env,
        files: req.files,
        check_live,
        start_timeout: Some(manager.env().client_start_timeout),
        name: Some(client_container_name(manager.instance_id(), &def.name, suite, test)),
        labels: container_labels,
        ..Default::default()
    };

    let backend = manager.backend().clone();
    let container_id = backend.create_container(&def.image, opts.clone()).await.map_err(
        |err| {
            error!(client = %def.name, %err, "API: client container create failed");
            err
        },
    )?;

    // The log path needs the container id, so it is set after creation.
    let log_path = client_log_path(&def.name, &container_id);
    opts.log_file = Some(manager.env().log_dir.join(&log_path));

    let info = match backend.start_container(&container_id, opts).await {
        Ok(info) => info,
        Err(err) => {
            error!(client = %def.name, container = %short_id(&container_id), %err,
                "API: could not start client");
            if let Err(del) = backend.delete_container(&container_id).await {
                error!(container = %short_id(&container_id), err = %del,
                    "API: could not remove failed client container");
            }
            return Err(err.into());
        }
    };

    let client_info = ClientInfo {
        id: info.id.clone(),
        ip: info.ip.clone(),
        name: def.name.clone(),
        instantiated_at: chrono::Utc::now(),
        log_file: log_path,
        wait: Some(info.wait.clone()),
    };
    manager.record_client_version(suite, &def.name, &def.version);
    if req.shared {
        manager.register_shared_node(suite, client_info)?;
    } else {
        manager.register_node(test, &info.id, client_info)?;
    }

    info!(client = %def.name, suite, test, container = %short_id(&info.id),
        "API: client started");
    Ok(Json(StartNodeResponse { id: info.id, ip: info.ip }))
}

fn client_container_name(instance: &str, client: &str, suite: SuiteId, test: TestId) -> String {
    let safe = client.replace(['/', ':'], "_");
    format!("hive-{instance}-{safe}-{suite}-{test}-{:x}", rand::random::<u32>())
}

/// The log path recorded in suite files always uses forward slashes; the
/// actual file lives under the run's log directory.
fn client_log_path(client: &str, container_id: &str) -> String {
    let safe_dir = client.replace(std::path::MAIN_SEPARATOR, "_");
    format!("{safe_dir}/client-{container_id}.log")
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[derive(Debug, Serialize)]
struct NodeResponse {
    id: String,
    name: String,
    ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    enode: Option<String>,
}

async fn node_info(
    State(manager): State<Arc<TestManager>>,
    Path((suite, test, node)): Path<(SuiteId, TestId, String)>,
) -> ApiResult<Json<NodeResponse>> {
    let info = manager.get_node_info(suite, test, &node)?;
    let enode = query_enode(&manager, suite, test, &info).await;
    Ok(Json(NodeResponse { id: info.id, name: info.name, ip: info.ip, enode }))
}

/// Runs `enode.sh` inside the client and patches the advertised address
/// with the container IP. Clients without the script report no enode.
async fn query_enode(
    manager: &TestManager,
    suite: SuiteId,
    test: TestId,
    info: &ClientInfo,
) -> Option<String> {
    let cmd = vec!["/hive-bin/enode.sh".to_string()];
    let exec = match manager.exec_in_node(suite, test, &info.id, cmd).await {
        Ok(exec) if exec.exit_code == 0 => exec,
        Ok(exec) => {
            error!(container = %short_id(&info.id), exit = exec.exit_code,
                "API: enode.sh failed");
            return None;
        }
        Err(err) => {
            error!(container = %short_id(&info.id), %err, "API: enode.sh exec error");
            return None;
        }
    };
    let url: EnodeUrl = match exec.stdout.trim().parse() {
        Ok(url) => url,
        Err(err) => {
            error!(container = %short_id(&info.id), %err, "API: bad enode.sh output");
            return None;
        }
    };
    let ip: IpAddr = info.ip.parse().ok()?;
    Some(url.rewritten_for(ip).to_string())
}

async fn stop_client(
    State(manager): State<Arc<TestManager>>,
    Path((suite, test, node)): Path<(SuiteId, TestId, String)>,
) -> ApiResult<Json<&'static str>> {
    manager.stop_node(suite, test, &node).await?;
    Ok(ok())
}

async fn pause_client(
    State(manager): State<Arc<TestManager>>,
    Path((suite, test, node)): Path<(SuiteId, TestId, String)>,
) -> ApiResult<Json<&'static str>> {
    manager.pause_node(suite, test, &node).await?;
    Ok(ok())
}

async fn unpause_client(
    State(manager): State<Arc<TestManager>>,
    Path((suite, test, node)): Path<(SuiteId, TestId, String)>,
) -> ApiResult<Json<&'static str>> {
    manager.unpause_node(suite, test, &node).await?;
    Ok(ok())
}

#[derive(Debug, Deserialize)]
struct ExecRequest {
    command: Vec<String>,
}

/// Validates an exec request. The script runs from the container's
/// `/hive-bin` directory and its name must not contain path separators.
fn parse_exec_command(mut command: Vec<String>) -> HiveResult<Vec<String>> {
    let script = command.first().ok_or_else(|| HiveError::BadRequest("empty command".into()))?;
    if script.contains('/') {
        return Err(HiveError::BadRequest(
            "script name must not contain directory separator".into(),
        ));
    }
    command[0] = format!("/hive-bin/{script}");
    Ok(command)
}

async fn exec_in_client(
    State(manager): State<Arc<TestManager>>,
    Path((suite, test, node)): Path<(SuiteId, TestId, String)>,
    Json(req): Json<ExecRequest>,
) -> ApiResult<Json<crate::libhive::backend::ExecInfo>> {
    let command = parse_exec_command(req.command)?;
    let info = manager.exec_in_node(suite, test, &node, command).await?;
    Ok(Json(info))
}

async fn network_create(
    State(manager): State<Arc<TestManager>>,
    Path((suite, network)): Path<(SuiteId, String)>,
) -> ApiResult<Json<String>> {
    let id = manager.create_network(suite, &network).await?;
    info!(suite, name = %network, "API: network created");
    Ok(Json(id))
}

async fn network_remove(
    State(manager): State<Arc<TestManager>>,
    Path((suite, network)): Path<(SuiteId, String)>,
) -> ApiResult<Json<&'static str>> {
    require_suite(&manager, suite)?;
    manager.remove_network(suite, &network).await?;
    info!(suite, name = %network, "API: network removed");
    Ok(ok())
}

async fn network_ip(
    State(manager): State<Arc<TestManager>>,
    Path((suite, network, node)): Path<(SuiteId, String, String)>,
) -> ApiResult<Json<IpAddr>> {
    require_suite(&manager, suite)?;
    let ip = manager.container_ip(suite, &network, &node).await?;
    Ok(Json(ip))
}

async fn network_connect(
    State(manager): State<Arc<TestManager>>,
    Path((suite, network, node)): Path<(SuiteId, String, String)>,
) -> ApiResult<Json<&'static str>> {
    require_suite(&manager, suite)?;
    manager.connect_container(suite, &network, &node).await?;
    info!(suite, name = %network, container = %short_id(&node), "API: container connected");
    Ok(ok())
}

async fn network_disconnect(
    State(manager): State<Arc<TestManager>>,
    Path((suite, network, node)): Path<(SuiteId, String, String)>,
) -> ApiResult<Json<&'static str>> {
    require_suite(&manager, suite)?;
    manager.disconnect_container(suite, &network, &node).await?;
    Ok(ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libhive::data::{ClientDefinition, ClientMetadata, SimEnv};
    use crate::libhive::fakes::FakeBackend;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<TestManager>) {
        let backend = Arc::new(FakeBackend::default());
        let clients = vec![ClientDefinition {
            name: "go-ethereum".to_string(),
            version: "geth v1.14".to_string(),
            image: "hive/clients/go-ethereum:latest".to_string(),
            meta: ClientMetadata::default(),
        }];
        let env = SimEnv { log_dir: std::env::temp_dir(), ..Default::default() };
        let manager = TestManager::new(env, backend, clients);
        (router(manager.clone()), manager)
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    fn json_post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_post(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
        let boundary = "hivetestboundary";
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        body.push_str(&format!("--{boundary}--\r\n"));
        Request::post(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }

    async fn start_suite_and_test(app: &Router) -> (SuiteId, TestId) {
        let (status, body) =
            send(app, json_post("/testsuite", r#"{"name":"sync","description":"d"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        let suite: SuiteId = body.parse().unwrap();
        let (status, body) = send(
            app,
            json_post(&format!("/testsuite/{suite}/test"), r#"{"name":"case"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        (suite, body.parse().unwrap())
    }

    #[tokio::test]
    async fn suite_and_test_lifecycle() {
        let (app, manager) = test_app();
        let (suite, test) = start_suite_and_test(&app).await;

        let (status, _) = send(
            &app,
            json_post(
                &format!("/testsuite/{suite}/test/{test}"),
                r#"{"summaryResult":{"pass":true,"details":"done"}}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::delete(format!("/testsuite/{suite}")).body(Body::empty()).unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);

        let results = manager.results();
        assert_eq!(results.len(), 1);
        assert!(results[0].test_cases[&test].summary_result.pass);
    }

    #[tokio::test]
    async fn end_test_accepts_bare_result_body() {
        let (app, manager) = test_app();
        let (suite, test) = start_suite_and_test(&app).await;
        let (status, _) = send(
            &app,
            json_post(&format!("/testsuite/{suite}/test/{test}"), r#"{"pass":false,"details":"x"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!manager.is_test_running(suite, test));
    }

    #[tokio::test]
    async fn end_test_requires_summary() {
        let (app, _) = test_app();
        let (suite, test) = start_suite_and_test(&app).await;
        let (status, body) =
            send(&app, json_post(&format!("/testsuite/{suite}/test/{test}"), "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("summary result"), "{body}");
    }

    #[tokio::test]
    async fn start_client_validates_client_value() {
        let (app, _) = test_app();
        let (suite, test) = start_suite_and_test(&app).await;
        let uri = format!("/testsuite/{suite}/test/{test}/node");

        let (status, body) = send(&app, multipart_post(&uri, &[("HIVE_LOGLEVEL", "5")])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("missing 'CLIENT'"), "{body}");

        let (status, body) = send(&app, multipart_post(&uri, &[("CLIENT", "nethermind")])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("unknown 'CLIENT'"), "{body}");
    }

    #[tokio::test]
    async fn start_client_returns_id_and_ip() {
        let (app, manager) = test_app();
        let (suite, test) = start_suite_and_test(&app).await;
        let uri = format!("/testsuite/{suite}/test/{test}/node");
        let (status, body) = send(&app, multipart_post(&uri, &[("CLIENT", "go-ethereum")])).await;
        assert_eq!(status, StatusCode::OK);

        let resp: serde_json::Value = serde_json::from_str(&body).unwrap();
        let id = resp["id"].as_str().unwrap();
        assert!(!resp["ip"].as_str().unwrap().is_empty());
        assert!(manager.get_node_info(suite, test, id).is_ok());
    }

    #[tokio::test]
    async fn only_hive_env_reaches_the_container() {
        use crate::libhive::backend::{ContainerInfo, ContainerWait};

        let captured: Arc<std::sync::Mutex<Vec<String>>> = Default::default();
        let sink = captured.clone();
        let mut backend = FakeBackend::default();
        backend.hooks.start_container = Some(Box::new(move |id, opts| {
            sink.lock().unwrap().extend(opts.env.keys().cloned());
            Ok(ContainerInfo {
                id: id.to_string(),
                ip: "192.0.2.9".to_string(),
                mac: "02:00:00:00:00:09".to_string(),
                wait: ContainerWait::resolved(),
            })
        }));
        let clients = vec![ClientDefinition {
            name: "go-ethereum".to_string(),
            version: "geth v1.14".to_string(),
            image: "hive/clients/go-ethereum:latest".to_string(),
            meta: ClientMetadata::default(),
        }];
        let env = SimEnv { log_dir: std::env::temp_dir(), ..Default::default() };
        let manager = TestManager::new(env, Arc::new(backend), clients);
        let app = router(manager);

        let (suite, test) = start_suite_and_test(&app).await;
        let uri = format!("/testsuite/{suite}/test/{test}/node");
        let fields =
            [("CLIENT", "go-ethereum"), ("HIVE_LOGLEVEL", "5"), ("PATH", "/tmp/evil")];
        let (status, _) = send(&app, multipart_post(&uri, &fields)).await;
        assert_eq!(status, StatusCode::OK);

        let keys = captured.lock().unwrap().clone();
        assert!(keys.iter().any(|k| k == "HIVE_LOGLEVEL"), "{keys:?}");
        assert!(!keys.iter().any(|k| k == "PATH"), "{keys:?}");
    }

    #[tokio::test]
    async fn bad_check_live_port_is_rejected() {
        let (app, _) = test_app();
        let (suite, test) = start_suite_and_test(&app).await;
        let uri = format!("/testsuite/{suite}/test/{test}/node");
        let fields = [("CLIENT", "go-ethereum"), ("HIVE_CHECK_LIVE_PORT", "99999")];
        let (status, body) = send(&app, multipart_post(&uri, &fields)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("HIVE_CHECK_LIVE_PORT"), "{body}");
    }

    #[tokio::test]
    async fn exec_rejects_path_separators() {
        assert!(parse_exec_command(vec!["../etc/passwd".to_string()]).is_err());
        assert!(parse_exec_command(Vec::new()).is_err());
        let cmd = parse_exec_command(vec!["enode.sh".to_string(), "-v".to_string()]).unwrap();
        assert_eq!(cmd[0], "/hive-bin/enode.sh");
    }

    #[tokio::test]
    async fn network_routes_roundtrip() {
        let (app, _) = test_app();
        let (suite, _test) = start_suite_and_test(&app).await;

        let req = Request::post(format!("/testsuite/{suite}/network/peernet"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("fakenet"), "{body}");

        let req = Request::get(format!("/testsuite/{suite}/network/peernet/some-container"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "\"192.0.2.100\"");

        let req = Request::delete(format!("/testsuite/{suite}/network/peernet"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::get(format!("/testsuite/{suite}/network/peernet/x"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_suite_and_test_are_bad_requests() {
        let (app, _) = test_app();
        let req = Request::delete("/testsuite/42").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("no such test suite"), "{body}");

        let (suite, _test) = start_suite_and_test(&app).await;
        let (status, body) = send(
            &app,
            json_post(
                &format!("/testsuite/{suite}/test/99"),
                r#"{"summaryResult":{"pass":true,"details":""}}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("no such test case"), "{body}");
    }

    #[tokio::test]
    async fn form_encoded_suite_meta_is_accepted() {
        let (app, _) = test_app();
        let req = Request::post("/testsuite")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("name=devp2p&description=discovery"))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "0");
    }
}
