//! Blocking HTTP generation service.
//!
//! `POST /generate` with `{temperature, top_k, max_tokens, prompt}` returns
//! `{output}`. A fixed pool of worker threads pulls requests from one
//! listening socket; the checkpoint is shared read-only between them.

use anyhow::{anyhow, Result};
use charformer_model::{Checkpoint, ExecutionContext, ModelError, SamplingParams};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{info, warn};

pub const GENERATE_PATH: &str = "/generate";

/// Request bodies above this size are rejected with 413.
pub const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub addr: String,
    pub workers: usize,
    pub max_tokens_limit: usize,
    /// Fixed per-request sampling seed. Requests are seeded from entropy when unset.
    pub seed: Option<u64>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
            workers: 4,
            max_tokens_limit: 2000,
            seed: None,
        }
    }
}

/// Request body. A missing `top_k` means 40; an explicit `null` disables top-k.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerateRequest {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: Option<i64>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
    #[serde(default)]
    pub prompt: Option<String>,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_k() -> Option<i64> {
    Some(40)
}

fn default_max_tokens() -> i64 {
    200
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            max_tokens: default_max_tokens(),
            prompt: None,
        }
    }
}

impl GenerateRequest {
    pub fn validate(&self, max_tokens_limit: usize) -> Result<(SamplingParams, usize), ModelError> {
        let params = SamplingParams::new(self.temperature, self.top_k)?;
        let max_tokens = usize::try_from(self.max_tokens).map_err(|_| {
            ModelError::sampling(
                "max_tokens",
                format!("must not be negative, got {}", self.max_tokens),
            )
        })?;
        if max_tokens > max_tokens_limit {
            return Err(ModelError::sampling(
                "max_tokens",
                format!("{} exceeds the limit of {}", max_tokens, max_tokens_limit),
            ));
        }
        Ok((params, max_tokens))
    }
}

#[derive(Debug, Serialize)]
struct GenerateResponse<'a> {
    output: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    kind: &'a str,
}

/// Status code and JSON body, before it is turned into a `tiny_http` response.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        let body = serde_json::to_string(value).unwrap_or_else(|_| {
            r#"{"error":"failed to encode response","kind":"internal"}"#.to_string()
        });
        Self { status, body }
    }

    fn error(status: u16, message: &str, kind: &str) -> Self {
        Self::json(status, &ErrorBody { error: message, kind })
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

pub struct GenerationService {
    checkpoint: Arc<Checkpoint>,
    ctx: ExecutionContext,
    max_tokens_limit: usize,
    seed: Option<u64>,
}

impl GenerationService {
    pub fn new(checkpoint: Arc<Checkpoint>, ctx: ExecutionContext, options: &ServeOptions) -> Self {
        Self {
            checkpoint,
            ctx,
            max_tokens_limit: options.max_tokens_limit,
            seed: options.seed,
        }
    }

    /// Routes one request. Transport concerns (reading the socket, headers)
    /// stay in [`serve`].
    pub fn handle(&self, method: &Method, url: &str, body: &str) -> Reply {
        let path = url.split('?').next().unwrap_or(url);
        if *method == Method::Options {
            return Reply::empty(204);
        }
        if path != GENERATE_PATH {
            return Reply::error(404, &format!("no route for {}", path), "not_found");
        }
        if *method != Method::Post {
            return Reply::error(405, "only POST is supported", "method_not_allowed");
        }

        let request: GenerateRequest = if body.trim().is_empty() {
            GenerateRequest::default()
        } else {
            match serde_json::from_str(body) {
                Ok(request) => request,
                Err(e) => return Reply::error(400, &e.to_string(), "invalid_request"),
            }
        };

        match self.generate(&request) {
            Ok(output) => Reply::json(200, &GenerateResponse { output: &output }),
            Err(e) if e.is_client_error() => Reply::error(400, &e.to_string(), e.kind()),
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "generation failed");
                Reply::error(500, &e.to_string(), e.kind())
            }
        }
    }

    fn generate(&self, request: &GenerateRequest) -> Result<String, ModelError> {
        let (params, max_tokens) = request.validate(self.max_tokens_limit)?;
        let mut rng = match self.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let generation = self.checkpoint.generator()?.generate(
            &self.ctx,
            request.prompt.as_deref(),
            &params,
            max_tokens,
            &mut rng,
        )?;
        Ok(generation.text)
    }
}

/// Binds `options.addr` and serves until the process exits.
pub fn serve(service: GenerationService, options: &ServeOptions) -> Result<()> {
    let server = Server::http(options.addr.as_str())
        .map_err(|e| anyhow!("failed to bind {}: {}", options.addr, e))?;
    let server = Arc::new(server);
    let service = Arc::new(service);
    let workers = options.workers.max(1);
    info!(addr = %options.addr, workers, "listening");

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let server = Arc::clone(&server);
            let service = Arc::clone(&service);
            thread::spawn(move || {
                for request in server.incoming_requests() {
                    respond(&service, worker, request);
                }
            })
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow!("server worker panicked"))?;
    }
    Ok(())
}

/// Reads at most `limit` bytes of UTF-8 body. Anything longer is a 413.
fn read_body(reader: impl Read, limit: u64) -> std::result::Result<String, Reply> {
    let mut body = String::new();
    if let Err(e) = reader.take(limit + 1).read_to_string(&mut body) {
        return Err(Reply::error(
            400,
            &format!("failed to read request body: {}", e),
            "invalid_request",
        ));
    }
    if body.len() as u64 > limit {
        return Err(Reply::error(
            413,
            &format!("request body exceeds {} bytes", limit),
            "payload_too_large",
        ));
    }
    Ok(body)
}

fn respond(service: &GenerationService, worker: usize, mut request: Request) {
    let started = Instant::now();
    let method = request.method().clone();
    let url = request.url().to_string();

    let reply = match read_body(request.as_reader(), MAX_BODY_BYTES) {
        Ok(body) => service.handle(&method, &url, &body),
        Err(reply) => reply,
    };

    info!(
        worker,
        method = %method,
        path = %url,
        status = reply.status,
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        "request"
    );

    let mut response =
        Response::from_string(reply.body).with_status_code(StatusCode(reply.status));
    let headers = [
        ("Content-Type", "application/json"),
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "POST, OPTIONS"),
        ("Access-Control-Allow-Headers", "Content-Type"),
    ];
    for (field, value) in headers {
        if let Ok(header) = Header::from_bytes(field.as_bytes(), value.as_bytes()) {
            response.add_header(header);
        }
    }
    if let Err(e) = request.respond(response) {
        warn!(error = %e, "failed to send response");
    }
}
