//! HTTP client for a real API server.
//!
//! Resources are created and watched through the plain REST endpoints of the
//! core, CDI and KubeVirt API groups. Watches are read as newline-delimited
//! JSON. Port streams use the KubeVirt `portforward` subresource over a
//! websocket, bridged into an in-process duplex pipe.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use futures::SinkExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tracing::{debug, instrument};

use crate::client::{ClusterClient, PortStream, WatchStream};
use crate::error::{ClusterError, Result};
use crate::kubeconfig::ClusterConnection;
use crate::types::{
    DataVolumePhase, DataVolumeSpec, InstancePhase, InstanceSpec, ResourceKind, ResourceName,
    ResourcePhase, SecretSpec,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PORT_BUFFER: usize = 16 * 1024;
const PORT_SUBPROTOCOL: &str = "plain.kubevirt.io";

fn api_version(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::DataVolume => "cdi.kubevirt.io/v1beta1",
        ResourceKind::Secret => "v1",
        ResourceKind::VirtualMachineInstance => "kubevirt.io/v1",
    }
}

fn kind_name(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::DataVolume => "DataVolume",
        ResourceKind::Secret => "Secret",
        ResourceKind::VirtualMachineInstance => "VirtualMachineInstance",
    }
}

fn collection_path(kind: ResourceKind, namespace: &str) -> String {
    match kind {
        ResourceKind::DataVolume => {
            format!("/apis/cdi.kubevirt.io/v1beta1/namespaces/{namespace}/datavolumes")
        }
        ResourceKind::Secret => format!("/api/v1/namespaces/{namespace}/secrets"),
        ResourceKind::VirtualMachineInstance => {
            format!("/apis/kubevirt.io/v1/namespaces/{namespace}/virtualmachineinstances")
        }
    }
}

fn metadata(name: &ResourceName) -> Value {
    match name {
        ResourceName::Fixed(name) => json!({ "name": name }),
        ResourceName::Generated(prefix) => json!({ "generateName": prefix }),
    }
}

/// Websocket URL for the same host as an HTTP(S) server URL.
fn websocket_base(server: &str) -> String {
    if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{server}")
    }
}

#[derive(Debug, Deserialize)]
struct ObjectHead {
    metadata: ObjectMeta,
    #[serde(default)]
    status: Option<ObjectStatus>,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectStatus {
    #[serde(default)]
    phase: String,
}

impl ObjectHead {
    fn phase(&self) -> &str {
        self.status.as_ref().map_or("", |s| s.phase.as_str())
    }
}

/// Body of a failed API request.
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: u16,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: Value,
}

/// Decode one line of a watch response. Bookmarks yield `None`.
fn decode_event<P: ResourcePhase>(
    line: &str,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
) -> Result<Option<P>> {
    let event: WatchEvent = serde_json::from_str(line)?;
    match event.event_type.as_str() {
        "ADDED" | "MODIFIED" => {
            let head: ObjectHead = serde_json::from_value(event.object)?;
            Ok(Some(P::from_raw(head.phase())))
        }
        "DELETED" => Err(ClusterError::NotFound {
            kind,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }),
        "BOOKMARK" => Ok(None),
        "ERROR" => {
            let status: ApiStatus = serde_json::from_value(event.object)?;
            Err(ClusterError::Api {
                status: status.code,
                message: status.message,
            })
        }
        other => Err(ClusterError::Watch(format!("unexpected event type {other:?}"))),
    }
}

type ByteStream<E> = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, E>> + Send>>;

/// Split a byte stream into trimmed, non-empty lines.
fn ndjson_lines<S, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
    ClusterError: From<E>,
{
    let source: ByteStream<E> = Box::pin(bytes);
    stream::unfold(
        (source, BytesMut::new(), false),
        |(mut source, mut buf, mut done)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.split_to(pos + 1);
                    let text = String::from_utf8_lossy(&line[..pos]).trim().to_owned();
                    if text.is_empty() {
                        continue;
                    }
                    return Some((Ok(text), (source, buf, done)));
                }

                if done {
                    let text = String::from_utf8_lossy(&buf).trim().to_owned();
                    buf.clear();
                    if text.is_empty() {
                        return None;
                    }
                    return Some((Ok(text), (source, buf, done)));
                }

                match source.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(ClusterError::from(e)), (source, buf, true))),
                    None => done = true,
                }
            }
        },
    )
}

async fn check(
    response: Response,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiStatus>(&body)
        .map(|s| s.message)
        .unwrap_or(body);

    Err(match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound {
            kind,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        },
        StatusCode::CONFLICT => ClusterError::AlreadyExists {
            kind,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        },
        other => ClusterError::Api {
            status: other.as_u16(),
            message,
        },
    })
}

/// [`ClusterClient`] backed by the API server's REST interface.
pub struct KubeClient {
    http: reqwest::Client,
    tls: native_tls::TlsConnector,
    connection: ClusterConnection,
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("server", &self.connection.server)
            .finish_non_exhaustive()
    }
}

impl KubeClient {
    /// Build a client for the given connection settings.
    pub fn new(connection: ClusterConnection) -> Result<Self> {
        let mut http = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        let mut tls = native_tls::TlsConnector::builder();

        if let Some(ca) = &connection.certificate_authority {
            http = http.add_root_certificate(reqwest::Certificate::from_pem(ca)?);
            tls.add_root_certificate(native_tls::Certificate::from_pem(ca)?);
        }
        if let Some(identity) = &connection.client_identity {
            http = http.identity(reqwest::Identity::from_pkcs8_pem(
                &identity.certificate_pem,
                &identity.key_pem,
            )?);
            tls.identity(native_tls::Identity::from_pkcs8(
                &identity.certificate_pem,
                &identity.key_pem,
            )?);
        }
        if connection.insecure_skip_tls_verify {
            http = http.danger_accept_invalid_certs(true);
            tls.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            http: http.build()?,
            tls: tls.build()?,
            connection,
        })
    }

    /// Build a client from the ambient kubeconfig or in-cluster settings.
    pub fn infer(kubeconfig: Option<&std::path::Path>, context: Option<&str>) -> Result<Self> {
        Self::new(ClusterConnection::infer(kubeconfig, context)?)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.connection.server.trim_end_matches('/'), path);
        let request = self.http.request(method, url);
        match &self.connection.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    #[instrument(skip(self, body))]
    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &ResourceName,
        body: Value,
    ) -> Result<String> {
        let requested = match name {
            ResourceName::Fixed(n) | ResourceName::Generated(n) => n.as_str(),
        };
        let response = self
            .request(Method::POST, &collection_path(kind, namespace))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let response = check(response, kind, namespace, requested).await?;
        let head: ObjectHead = response.json().await?;
        debug!(namespace, name = %head.metadata.name, "resource created");
        Ok(head.metadata.name)
    }

    async fn get_phase(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>> {
        let path = format!("{}/{name}", collection_path(kind, namespace));
        let response = self
            .request(Method::GET, &path)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        match check(response, kind, namespace, name).await {
            Ok(response) => {
                let head: ObjectHead = response.json().await?;
                Ok(Some(head.phase().to_owned()))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        let path = format!(
            "{}/{name}?propagationPolicy=Background",
            collection_path(kind, namespace)
        );
        let response = self
            .request(Method::DELETE, &path)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(response, kind, namespace, name).await?;
        debug!(%kind, namespace, name, "resource deleted");
        Ok(())
    }

    async fn watch<P: ResourcePhase>(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<WatchStream<P>> {
        let path = format!(
            "{}?watch=true&fieldSelector=metadata.name%3D{name}",
            collection_path(kind, namespace)
        );
        let response = self.request(Method::GET, &path).send().await?;
        let response = check(response, kind, namespace, name).await?;

        let namespace = namespace.to_owned();
        let name = name.to_owned();
        let events = ndjson_lines(response.bytes_stream()).filter_map(move |line| {
            let decoded = line.and_then(|line| decode_event::<P>(&line, kind, &namespace, &name));
            async move { decoded.transpose() }
        });
        Ok(events.boxed())
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn create_data_volume(
        &self,
        namespace: &str,
        name: &ResourceName,
        spec: &DataVolumeSpec,
    ) -> Result<String> {
        let kind = ResourceKind::DataVolume;
        let body = json!({
            "apiVersion": api_version(kind),
            "kind": kind_name(kind),
            "metadata": metadata(name),
            "spec": spec,
        });
        self.create(kind, namespace, name, body).await
    }

    async fn get_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DataVolumePhase>> {
        let phase = self
            .get_phase(ResourceKind::DataVolume, namespace, name)
            .await?;
        Ok(phase.map(|p| DataVolumePhase::from_raw(&p)))
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete(ResourceKind::DataVolume, namespace, name).await
    }

    async fn watch_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WatchStream<DataVolumePhase>> {
        self.watch(ResourceKind::DataVolume, namespace, name).await
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &ResourceName,
        spec: &SecretSpec,
    ) -> Result<String> {
        let kind = ResourceKind::Secret;
        let body = json!({
            "apiVersion": api_version(kind),
            "kind": kind_name(kind),
            "metadata": metadata(name),
            "type": "Opaque",
            "stringData": spec.string_data,
        });
        self.create(kind, namespace, name, body).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete(ResourceKind::Secret, namespace, name).await
    }

    async fn create_instance(
        &self,
        namespace: &str,
        name: &ResourceName,
        spec: &InstanceSpec,
    ) -> Result<String> {
        let kind = ResourceKind::VirtualMachineInstance;
        let body = json!({
            "apiVersion": api_version(kind),
            "kind": kind_name(kind),
            "metadata": metadata(name),
            "spec": spec,
        });
        self.create(kind, namespace, name, body).await
    }

    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<InstancePhase>> {
        let phase = self
            .get_phase(ResourceKind::VirtualMachineInstance, namespace, name)
            .await?;
        Ok(phase.map(|p| InstancePhase::from_raw(&p)))
    }

    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete(ResourceKind::VirtualMachineInstance, namespace, name)
            .await
    }

    async fn watch_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WatchStream<InstancePhase>> {
        self.watch(ResourceKind::VirtualMachineInstance, namespace, name)
            .await
    }

    async fn open_port_stream(&self, namespace: &str, name: &str, port: u16) -> Result<PortStream> {
        let port_error = |message: String| ClusterError::PortStream {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            port,
            message,
        };

        let url = format!(
            "{}/apis/subresources.kubevirt.io/v1/namespaces/{namespace}/virtualmachineinstances/{name}/portforward/{port}/tcp",
            websocket_base(self.connection.server.trim_end_matches('/'))
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| port_error(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(PORT_SUBPROTOCOL),
        );
        if let Some(token) = &self.connection.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| port_error(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let connector = Connector::NativeTls(self.tls.clone());
        let (socket, _) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector))
                .await
                .map_err(|e| port_error(e.to_string()))?;

        let (local, remote) = tokio::io::duplex(PORT_BUFFER);
        tokio::spawn(bridge(socket, remote));
        debug!(namespace, name, port, "port stream opened");
        Ok(Box::new(local))
    }
}

/// Copy bytes between the websocket and the duplex pipe until either side
/// closes.
async fn bridge<S>(socket: tokio_tungstenite::WebSocketStream<S>, pipe: DuplexStream)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = socket.split();
    let (mut reader, mut writer) = tokio::io::split(pipe);
    let mut buf = vec![0u8; PORT_BUFFER];

    loop {
        tokio::select! {
            message = source.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "port stream error");
                    break;
                }
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    let _ = writer.shutdown().await;
    let _ = sink.close().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        let parts: Vec<std::io::Result<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        stream::iter(parts)
    }

    #[tokio::test]
    async fn lines_are_split_across_chunks() {
        let lines: Vec<String> = ndjson_lines(chunks(&["{\"a\":", "1}\n\n{\"b\"", ":2}\n{\"c\":3}"]))
            .map(|l| l.unwrap())
            .collect()
            .await;

        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]);
    }

    #[tokio::test]
    async fn read_error_ends_the_stream() {
        let parts: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"one\n")),
            Err(std::io::Error::other("reset")),
        ];
        let items: Vec<Result<String>> = ndjson_lines(stream::iter(parts)).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "one");
        assert!(matches!(items[1], Err(ClusterError::Io(_))));
    }

    #[test]
    fn modified_event_yields_phase() {
        let line = r#"{"type":"MODIFIED","object":{"metadata":{"name":"dv"},"status":{"phase":"ImportInProgress"}}}"#;
        let phase: Option<DataVolumePhase> =
            decode_event(line, ResourceKind::DataVolume, "ns", "dv").unwrap();
        assert_eq!(phase, Some(DataVolumePhase::ImportInProgress));
    }

    #[test]
    fn missing_status_is_unset() {
        let line = r#"{"type":"ADDED","object":{"metadata":{"name":"dv"}}}"#;
        let phase: Option<DataVolumePhase> =
            decode_event(line, ResourceKind::DataVolume, "ns", "dv").unwrap();
        assert_eq!(phase, Some(DataVolumePhase::Unset));
    }

    #[test]
    fn bookmark_is_skipped_and_delete_is_not_found() {
        let bookmark = r#"{"type":"BOOKMARK","object":{"metadata":{"name":""}}}"#;
        let phase: Option<InstancePhase> =
            decode_event(bookmark, ResourceKind::VirtualMachineInstance, "ns", "vm").unwrap();
        assert!(phase.is_none());

        let deleted = r#"{"type":"DELETED","object":{"metadata":{"name":"vm"}}}"#;
        let err = decode_event::<InstancePhase>(
            deleted,
            ResourceKind::VirtualMachineInstance,
            "ns",
            "vm",
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn error_event_carries_status() {
        let line = r#"{"type":"ERROR","object":{"kind":"Status","code":410,"message":"too old resource version"}}"#;
        let err =
            decode_event::<DataVolumePhase>(line, ResourceKind::DataVolume, "ns", "dv").unwrap_err();
        assert!(matches!(err, ClusterError::Api { status: 410, .. }));
    }

    #[test]
    fn websocket_base_follows_scheme() {
        assert_eq!(websocket_base("https://10.0.0.1:6443"), "wss://10.0.0.1:6443");
        assert_eq!(websocket_base("http://localhost:8080"), "ws://localhost:8080");
    }

    #[test]
    fn generated_names_use_generate_name() {
        assert_eq!(
            metadata(&ResourceName::generated("bake-")),
            json!({ "generateName": "bake-" })
        );
        assert_eq!(
            collection_path(ResourceKind::Secret, "builds"),
            "/api/v1/namespaces/builds/secrets"
        );
    }
}
