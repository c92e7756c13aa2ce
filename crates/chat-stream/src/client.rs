use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::ChatError;
use crate::decoder::{ChatReply, StreamObserver, decode_stream};

pub const DEFAULT_BASE_URL: &str = "https://api.dify.ai/v1";
pub const DEFAULT_USER: &str = "json-formatter-user";

/// One question about a JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatRequest {
    pub json_content: String,
    pub query: String,
    /// Empty for the first turn of a conversation.
    pub conversation_id: String,
}

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub user: String,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            user: DEFAULT_USER.to_string(),
        }
    }
}

#[derive(Serialize)]
struct RequestBody<'a> {
    inputs: Inputs<'a>,
    query: &'a str,
    response_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    user: &'a str,
}

#[derive(Serialize)]
struct Inputs<'a> {
    json_content: &'a str,
}

/// Anything that can answer a chat turn while streaming progress.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send(
        &self,
        request: &ChatRequest,
        observer: &mut (dyn StreamObserver + Send),
    ) -> Result<ChatReply, ChatError>;
}

pub struct ChatClient {
    http: reqwest::Client,
    config: ChatClientConfig,
}

impl ChatClient {
    pub fn new(config: ChatClientConfig) -> Result<Self, ChatError> {
        // Only the connect phase is bounded; a reply may stream for as long
        // as the service keeps sending.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat-messages", self.config.base_url.trim_end_matches('/'))
    }

    fn body<'a>(&'a self, request: &'a ChatRequest) -> RequestBody<'a> {
        RequestBody {
            inputs: Inputs {
                json_content: &request.json_content,
            },
            query: &request.query,
            response_mode: "streaming",
            conversation_id: Some(request.conversation_id.as_str()).filter(|id| !id.is_empty()),
            user: &self.config.user,
        }
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    async fn send(
        &self,
        request: &ChatRequest,
        observer: &mut (dyn StreamObserver + Send),
    ) -> Result<ChatReply, ChatError> {
        let url = self.endpoint();
        debug!(
            url = %url,
            has_conversation = !request.conversation_id.is_empty(),
            "sending chat request"
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&self.body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "chat service rejected request");
            return Err(ChatError::Transport {
                status: status.as_u16(),
                body,
            });
        }

        decode_stream(response.bytes_stream(), observer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder {
        answers: Vec<String>,
        conversation_ids: Vec<String>,
    }

    impl StreamObserver for Recorder {
        fn on_answer(&mut self, answer: &str) {
            self.answers.push(answer.to_string());
        }

        fn on_conversation_id(&mut self, conversation_id: &str) {
            self.conversation_ids.push(conversation_id.to_string());
        }
    }

    fn client_for(server: &MockServer) -> ChatClient {
        ChatClient::new(ChatClientConfig {
            base_url: format!("{}/", server.uri()),
            api_key: "secret".to_string(),
            user: "tester".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn first_turn_omits_conversation_id() {
        let client = ChatClient::new(ChatClientConfig::default()).unwrap();
        let request = ChatRequest {
            json_content: "{\"a\":1}".to_string(),
            query: "what is a?".to_string(),
            conversation_id: String::new(),
        };
        let body = serde_json::to_value(client.body(&request)).unwrap();
        assert_eq!(
            body,
            json!({
                "inputs": {"json_content": "{\"a\":1}"},
                "query": "what is a?",
                "response_mode": "streaming",
                "user": DEFAULT_USER,
            })
        );
        assert_eq!(client.endpoint(), "https://api.dify.ai/v1/chat-messages");
    }

    #[tokio::test]
    async fn streams_reply_from_service() {
        let server = MockServer::start().await;
        let stream = concat!(
            "data: {\"event\":\"message\",\"answer\":\"Hel\",\"conversation_id\":\"c1\",\"message_id\":\"m1\"}\n\n",
            "data: {\"event\":\"message\",\"answer\":\"lo\",\"message_id\":\"m1\"}\n\n",
            "data: {\"event\":\"message_end\",\"conversation_id\":\"c1\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({
                "inputs": {"json_content": "[]"},
                "query": "hi",
                "response_mode": "streaming",
                "conversation_id": "c0",
                "user": "tester",
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(stream.as_bytes(), "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let request = ChatRequest {
            json_content: "[]".to_string(),
            query: "hi".to_string(),
            conversation_id: "c0".to_string(),
        };
        let mut recorder = Recorder::default();
        let reply = client_for(&server)
            .send(&request, &mut recorder)
            .await
            .unwrap();
        assert_eq!(reply.answer, "Hello");
        assert_eq!(reply.message_id, "m1");
        assert_eq!(reply.conversation_id.as_deref(), Some("c1"));
        assert_eq!(recorder.answers, ["Hel", "Hello"]);
        assert_eq!(recorder.conversation_ids, ["c1"]);
    }

    #[tokio::test]
    async fn error_status_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .send(&ChatRequest::default(), &mut ())
            .await
            .unwrap_err();
        match err {
            ChatError::Transport { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
