//! Browser chat demo: a small axum server that streams generated text.
//!
//! Generation runs on a dedicated OS thread because the model forward pass is
//! synchronous; text chunks cross into async land over a bounded channel. If
//! the client disconnects, the channel's receiver is dropped, the next send
//! from the generation thread fails, and generation stops.

use crate::data::{AlpacaPromptFormatter, PromptFormatter};
use crate::generate::{generate_text, GenerationConfig, TextStreamer, EOS_TOKEN_ID};
use crate::model::GPTModel;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{
    mpsc::{sync_channel, RecvTimeoutError},
    Arc,
};
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// How long the response stream waits for the next chunk before treating the
/// generation thread as stalled.
const STREAM_RECV_TIMEOUT: Duration = Duration::from_secs(60);
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Everything a chat request needs, shared across handlers.
#[derive(Clone)]
pub struct ChatState {
    pub model: Arc<GPTModel>,
    pub tokenizer: Arc<tiktoken_rs::CoreBPE>,
    pub context_length: usize,
    pub device: Device,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatTurn {
    pub user: String,
    pub assistant: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    /// Upper bound on prompt plus generated tokens.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_max_length() -> usize {
    1_024
}

fn default_top_p() -> f32 {
    0.7
}

fn default_temperature() -> f64 {
    0.95
}

/// Renders the running conversation plus the new query into a single prompt,
/// ending right where the model's next response should begin.
pub fn build_chat_prompt(history: &[ChatTurn], query: &str) -> String {
    let formatter = AlpacaPromptFormatter;
    let mut prompt = String::new();
    for turn in history {
        prompt.push_str(&formatter.format_input(&turn.user, None));
        prompt.push_str("\n\n### Response:\n");
        prompt.push_str(&turn.assistant);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&formatter.format_input(query, None));
    prompt.push_str("\n\n### Response:\n");
    prompt
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn chat_handler(
    State(state): State<ChatState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.query.trim().is_empty() {
        return bad_request("query must not be empty");
    }
    if request.max_length == 0 || request.max_length > state.context_length {
        return bad_request("max_length must be between 1 and the model context length");
    }
    if !(0_f32..=1_f32).contains(&request.top_p) {
        return bad_request("top_p must be between 0 and 1");
    }
    if !(0_f64..=2_f64).contains(&request.temperature) {
        return bad_request("temperature must be between 0 and 2");
    }

    let prompt = build_chat_prompt(&request.history, &request.query);
    let prompt_ids = state.tokenizer.encode_with_special_tokens(&prompt);
    if prompt_ids.len() >= request.max_length {
        return bad_request("prompt is too long for the requested max_length");
    }

    let gen_cfg = GenerationConfig {
        max_new_tokens: request.max_length - prompt_ids.len(),
        context_size: state.context_length,
        temperature: request.temperature,
        top_p: Some(request.top_p),
        eos_id: Some(EOS_TOKEN_ID),
    };

    let (tx, rx) = sync_channel::<String>(STREAM_CHANNEL_CAPACITY);
    let model = Arc::clone(&state.model);
    let tokenizer = Arc::clone(&state.tokenizer);
    let device = state.device.clone();

    std::thread::spawn(move || {
        let num_prompt_tokens = prompt_ids.len();
        let idx = match Tensor::from_vec(prompt_ids, (1_usize, num_prompt_tokens), &device) {
            Ok(idx) => idx,
            Err(err) => {
                tracing::error!(%err, "failed to build prompt tensor");
                return;
            }
        };
        let mut streamer = TextStreamer::new(tokenizer, tx);
        let mut rng = StdRng::from_entropy();
        if let Err(err) = generate_text(&model, idx, &gen_cfg, &mut rng, Some(&mut streamer)) {
            tracing::error!(%err, "generation failed");
        }
    });

    let stream = futures::stream::unfold(rx, |rx| async move {
        let (chunk, rx) = tokio::task::spawn_blocking(move || {
            let chunk = rx.recv_timeout(STREAM_RECV_TIMEOUT);
            (chunk, rx)
        })
        .await
        .ok()?;
        match chunk {
            Ok(text) => Some((Ok::<Bytes, Infallible>(Bytes::from(text)), rx)),
            Err(RecvTimeoutError::Disconnected) => None,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("generation produced no output within the stream timeout");
                None
            }
        }
    });

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response()
}

pub fn create_router(state: ChatState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_check))
        .route("/chat", post(chat_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `addr` and serves the chat demo until the process exits.
pub async fn serve(state: ChatState, addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;
    let app = create_router(state);
    tracing::info!("serving chat demo on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>pairtune chat</title>
<style>
  body { font-family: sans-serif; max-width: 48rem; margin: 2rem auto; padding: 0 1rem; }
  #log { border: 1px solid #ccc; border-radius: 6px; padding: 1rem; min-height: 16rem;
         margin-bottom: 1rem; white-space: pre-wrap; }
  .user { color: #225; font-weight: bold; }
  .assistant { color: #141; }
  form { display: flex; gap: .5rem; }
  input { flex: 1; padding: .5rem; }
</style>
</head>
<body>
<h1>pairtune chat</h1>
<div id="log"></div>
<form id="chat-form">
  <input id="query" autocomplete="off" placeholder="Ask something...">
  <button type="submit">Send</button>
</form>
<script>
const history = [];
const log = document.getElementById('log');
const form = document.getElementById('chat-form');
const input = document.getElementById('query');

function append(cls, text) {
  const div = document.createElement('div');
  div.className = cls;
  div.textContent = text;
  log.appendChild(div);
  return div;
}

form.addEventListener('submit', async (e) => {
  e.preventDefault();
  const query = input.value.trim();
  if (!query) return;
  input.value = '';
  append('user', 'you: ' + query);
  const out = append('assistant', '');

  const res = await fetch('/chat', {
    method: 'POST',
    headers: { 'Content-Type': 'application/json' },
    body: JSON.stringify({ query, history }),
  });
  if (!res.ok) {
    const err = await res.json().catch(() => ({ error: res.statusText }));
    out.textContent = 'error: ' + err.error;
    return;
  }

  const reader = res.body.getReader();
  const decoder = new TextDecoder();
  let answer = '';
  for (;;) {
    const { done, value } = await reader.read();
    if (done) break;
    answer += decoder.decode(value, { stream: true });
    out.textContent = answer;
  }
  history.push({ user: query, assistant: answer });
});
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Config;
    use anyhow::Result;
    use axum::http::Request;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};
    use http_body_util::BodyExt;
    use tiktoken_rs::get_bpe_from_model;
    use tower::ServiceExt;

    fn test_state() -> ChatState {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        // full GPT-2 vocabulary so real tokenizer output is always in range,
        // but a tiny backbone to keep the tests fast
        let cfg = Config {
            vocab_size: 50_257,
            context_length: 96,
            emb_dim: 12,
            n_heads: 3,
            n_layers: 1,
            drop_rate: 0.0,
            qkv_bias: false,
        };
        let model = GPTModel::new(cfg, vb.pp("model")).unwrap();
        ChatState {
            model: Arc::new(model),
            tokenizer: Arc::new(get_bpe_from_model("gpt2").unwrap()),
            context_length: cfg.context_length,
            device: Device::Cpu,
        }
    }

    fn chat_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_index_serves_chat_page() -> Result<()> {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await?.to_bytes();
        assert!(std::str::from_utf8(&body)?.contains("<html"));
        Ok(())
    }

    #[tokio::test]
    async fn test_health_check() -> Result<()> {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_query() -> Result<()> {
        let app = create_router(test_state());
        let response = app.oneshot(chat_request(json!({ "query": "  " }))).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn test_chat_rejects_bad_sampling_params() -> Result<()> {
        let state = test_state();

        let response = create_router(state.clone())
            .oneshot(chat_request(json!({ "query": "hi", "top_p": 1.5 })))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = create_router(state)
            .oneshot(chat_request(json!({ "query": "hi", "temperature": -0.1 })))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn test_chat_rejects_oversized_prompt() -> Result<()> {
        let app = create_router(test_state());
        let response = app
            .oneshot(chat_request(json!({ "query": "hi", "max_length": 4 })))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn test_chat_streams_generated_text() -> Result<()> {
        let app = create_router(test_state());
        let response = app
            .oneshot(chat_request(json!({
                "query": "Hello",
                "max_length": 60,
                "temperature": 0.0,
            })))
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        // an untrained model emits arbitrary tokens; the stream just has to
        // terminate and decode as text
        let body = response.into_body().collect().await?.to_bytes();
        assert!(std::str::from_utf8(&body).is_ok());
        Ok(())
    }

    #[test]
    fn test_build_chat_prompt_includes_history() {
        let history = vec![ChatTurn {
            user: "What is two plus two?".to_string(),
            assistant: "Four.".to_string(),
        }];
        let prompt = build_chat_prompt(&history, "And times three?");

        assert!(prompt.contains("What is two plus two?"));
        assert!(prompt.contains("Four."));
        assert!(prompt.ends_with("### Response:\n"));
        let first = prompt.find("### Instruction:").unwrap();
        let second = prompt.rfind("### Instruction:").unwrap();
        assert!(first < second);
    }
}
