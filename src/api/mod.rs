use crate::config::CameraUrl;
use crate::error::RegistryError;
use crate::publish::{StreamEnd, StreamPublisher, MULTIPART_CONTENT_TYPE};
use crate::registry::CameraRegistry;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const INDEX_HTML: &str = include_str!("index.html");

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Open video streams end within one wait slice.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Control plane, video streams and the dashboard page.
pub struct ApiServer {
    cfg: ApiConfig,
    registry: Arc<CameraRegistry>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, registry: Arc<CameraRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let registry = self.registry;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, registry, shutdown_thread) {
                log::error!("camera api stopped: {}", err);
            }
        });
        log::info!("camera api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    registry: Arc<CameraRegistry>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let registry = registry.clone();
                let shutdown = shutdown.clone();
                // video responses are long-lived, so every connection gets a thread
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &registry, shutdown) {
                        log::warn!("camera api request from {} failed: {}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AddCameraRequest {
    camera_id: Option<String>,
    camera_url: Option<CameraUrl>,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    success: bool,
    message: String,
}

impl ControlResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    registry: &CameraRegistry,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let path = request.path.as_str();

    match (request.method.as_str(), path) {
        ("GET", "/") => write_response(&mut stream, 200, "text/html; charset=utf-8", INDEX_HTML.as_bytes()),
        ("GET", "/health") => {
            let body = serde_json::json!({ "status": "ok", "cameras": registry.len() });
            write_json(&mut stream, 200, &body)
        }
        ("GET", "/list_cameras") => write_json(&mut stream, 200, &registry.list()),
        ("POST", "/add_camera") => {
            let response = add_camera(registry, &request.body);
            write_json(&mut stream, 200, &response)
        }
        ("POST", _) if path.starts_with("/remove_camera/") => {
            let id = percent_decode(&path["/remove_camera/".len()..]);
            let response = match registry.remove(&id) {
                Ok(()) => ControlResponse::ok(format!("Camera {} removed", id)),
                Err(RegistryError::NotFound(_)) => ControlResponse::failed("Camera not found"),
                Err(err) => ControlResponse::failed(err.to_string()),
            };
            write_json(&mut stream, 200, &response)
        }
        ("GET", _) if path.starts_with("/video/") => {
            let id = percent_decode(&path["/video/".len()..]);
            stream_video(stream, registry, &id, shutdown)
        }
        (_, "/") | (_, "/health") | (_, "/list_cameras") | (_, "/add_camera") => {
            write_json_str(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_str(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn add_camera(registry: &CameraRegistry, body: &[u8]) -> ControlResponse {
    let parsed: Option<AddCameraRequest> = serde_json::from_slice(body).ok();
    let (id, url) = match parsed {
        Some(AddCameraRequest {
            camera_id: Some(id),
            camera_url: Some(url),
        }) if !id.is_empty() => (id, url),
        _ => return ControlResponse::failed("Invalid data"),
    };
    match registry.add(&id, &url.to_descriptor()) {
        Ok(()) => ControlResponse::ok(format!("Camera {} added", id)),
        Err(RegistryError::SourceUnavailable(reason)) => {
            log::warn!("camera {} could not be opened: {}", id, reason);
            ControlResponse::failed(format!("Failed to open camera: {}", reason))
        }
        Err(err) => ControlResponse::failed(err.to_string()),
    }
}

fn stream_video(
    mut stream: TcpStream,
    registry: &CameraRegistry,
    id: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let subscription = match registry.subscribe(id) {
        Ok(subscription) => subscription,
        Err(_) => {
            let body = ControlResponse::failed("Camera not found");
            return write_json(&mut stream, 404, &body);
        }
    };
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        MULTIPART_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let publisher = StreamPublisher::new(subscription).with_stop_flag(shutdown);
    match publisher.run(&mut stream) {
        StreamEnd::SubscriberDisconnected => log::debug!("video client for {} went away", id),
        StreamEnd::SessionClosed => log::debug!("video for {} ended with its session", id),
        StreamEnd::ServerStopping => {}
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request head"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json<T: Serialize + ?Sized>(stream: &mut TcpStream, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_str(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

/// Decode `%XX` escapes in a path segment. Malformed escapes are kept verbatim.
fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}
