//! The retrieval-augmented answer pipeline.
//!
//! Embed the latest message, fetch the nearest professor records, splice
//! them into the conversation and relay the streamed completion. The three
//! upstream calls run strictly in sequence.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use profsage_core::{Error, ProfSageConfig, Result, Timeouts};
use reqwest::Client;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::openai::{OpenAIChat, OpenAIEmbedder};
use crate::pinecone::PineconeIndex;
use crate::prompt::build_messages;
use crate::services::{ChunkStream, Embedder, Generator, VectorIndex};
use crate::types::{ChatMessage, GenerationChunk};

/// Number of nearest records spliced into every prompt.
pub const TOP_K: usize = 3;

/// Output byte stream handed to the HTTP layer.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Upper bounds for each outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub embed: Duration,
    pub query: Duration,
    /// Time allowed for the completion stream to open.
    pub generation: Duration,
}

impl From<&Timeouts> for StageTimeouts {
    fn from(t: &Timeouts) -> Self {
        Self {
            embed: t.embed(),
            query: t.query(),
            generation: t.generation(),
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self::from(&Timeouts::default())
    }
}

pub struct RagPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn Generator>,
    timeouts: StageTimeouts,
}

impl RagPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            embedder,
            index,
            generator,
            timeouts: StageTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Wire the OpenAI and Pinecone clients from configuration. Fails with
    /// `MissingCredential` when either API key is absent.
    pub fn from_config(config: &ProfSageConfig) -> Result<Self> {
        let openai_key = config
            .openai_api_key
            .as_deref()
            .ok_or(Error::MissingCredential("OPENAI_API_KEY"))?;
        let pinecone_key = config
            .pinecone_api_key
            .as_deref()
            .ok_or(Error::MissingCredential("PINECONE_API_KEY"))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        let embedder = OpenAIEmbedder::new(
            client.clone(),
            &config.openai_base_url,
            openai_key,
            &config.embedding_model,
        );
        let generator = OpenAIChat::new(
            client.clone(),
            &config.openai_base_url,
            openai_key,
            &config.chat_model,
        );
        let mut index = PineconeIndex::new(
            client,
            pinecone_key,
            &config.pinecone_control_plane,
            &config.index_name,
            &config.namespace,
        );
        if let Some(host) = &config.pinecone_index_host {
            index = index.with_host(host);
        }

        Ok(Self::new(Arc::new(embedder), Arc::new(index), Arc::new(generator))
            .with_timeouts(StageTimeouts::from(&config.timeouts)))
    }

    /// Run retrieval and open the completion stream.
    ///
    /// Everything up to and including opening the stream happens before this
    /// returns, so those failures never produce partial output. Errors after
    /// that terminate the returned stream.
    pub async fn answer(&self, conversation: &[ChatMessage]) -> Result<DeltaStream> {
        let last = conversation.last().ok_or(Error::EmptyConversation)?;

        let vector = with_timeout(
            "embedding",
            self.timeouts.embed,
            self.embedder.embed(&last.content),
        )
        .await?;
        debug!("Embedded query into {} dims", vector.len());

        let matches = with_timeout(
            "vector query",
            self.timeouts.query,
            self.index.query(&vector, TOP_K),
        )
        .await?;
        info!(
            "Retrieved {} matches: {:?}",
            matches.len(),
            matches.iter().map(|m| m.id.as_str()).collect::<Vec<_>>()
        );

        let messages = build_messages(conversation, &matches)?;

        let chunks = with_timeout(
            "generation stream",
            self.timeouts.generation,
            self.generator.generate(messages),
        )
        .await?;

        Ok(relay_deltas(chunks))
    }
}

async fn with_timeout<T>(
    stage: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            stage,
            millis: limit.as_millis() as u64,
        }),
    }
}

/// Forward non-empty deltas as UTF-8 bytes in arrival order. Chunks without
/// content are skipped; the first error is yielded and ends the stream.
///
/// Nothing is pulled from upstream until the consumer polls, and dropping
/// the returned stream drops the upstream response.
pub fn relay_deltas(mut chunks: ChunkStream) -> DeltaStream {
    Box::pin(async_stream::stream! {
        while let Some(item) = chunks.next().await {
            match item {
                Ok(GenerationChunk { delta: Some(text) }) if !text.is_empty() => {
                    yield Ok(Bytes::from(text));
                }
                Ok(_) => continue,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::SYSTEM_PROMPT;
    use crate::types::{Match, MatchMetadata, Role};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeEmbedder {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(text.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(Error::Embedding("API error 401: invalid key".into()));
            }
            Ok(vec![0.1, 0.2, 0.3])
        }
    }

    #[derive(Default)]
    struct FakeIndex {
        calls: AtomicUsize,
        requested_k: Mutex<Vec<usize>>,
        matches: Vec<Match>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl VectorIndex for FakeIndex {
        async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<Match>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(vector, [0.1f32, 0.2, 0.3].as_slice());
            self.requested_k.lock().unwrap().push(top_k);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.matches.iter().take(top_k).cloned().collect())
        }
    }

    enum Scripted {
        Text(&'static str),
        Empty,
        Fail(&'static str),
    }

    #[derive(Default)]
    struct FakeGenerator {
        calls: AtomicUsize,
        received: Mutex<Vec<ChatMessage>>,
        script: Vec<Scripted>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Generator for FakeGenerator {
        async fn generate(&self, messages: Vec<ChatMessage>) -> Result<ChunkStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.received.lock().unwrap() = messages;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let items: Vec<Result<GenerationChunk>> = self
                .script
                .iter()
                .map(|s| match s {
                    Scripted::Text(t) => Ok(GenerationChunk::text(*t)),
                    Scripted::Empty => Ok(GenerationChunk::empty()),
                    Scripted::Fail(msg) => Err(Error::Generation(msg.to_string())),
                })
                .collect();
            Ok(Box::pin(tokio_stream::iter(items)))
        }
    }

    fn prof(id: &str, subject: &str, stars: f64) -> Match {
        Match {
            id: id.into(),
            score: None,
            metadata: MatchMetadata {
                subject: Some(subject.into()),
                stars: Some(stars.to_string()),
                review: None,
            },
        }
    }

    fn calculus_profs() -> Vec<Match> {
        vec![
            prof("Dr. A", "Math", 4.5),
            prof("Dr. B", "Math", 4.0),
            prof("Dr. C", "Math", 3.8),
        ]
    }

    async fn collect(mut stream: DeltaStream) -> (Vec<u8>, Option<Error>) {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e) => return (out, Some(e)),
            }
        }
        (out, None)
    }

    #[tokio::test]
    async fn test_end_to_end_calculus_question() {
        let embedder = Arc::new(FakeEmbedder::default());
        let index = Arc::new(FakeIndex {
            matches: calculus_profs(),
            ..Default::default()
        });
        let generator = Arc::new(FakeGenerator {
            script: vec![
                Scripted::Empty,
                Scripted::Text("Based"),
                Scripted::Text(" on"),
                Scripted::Text(" reviews..."),
                Scripted::Empty,
            ],
            ..Default::default()
        });
        let pipeline = RagPipeline::new(embedder.clone(), index.clone(), generator.clone());

        let question = "Who teaches a good intro calculus course?";
        let stream = pipeline.answer(&[ChatMessage::user(question)]).await.unwrap();
        let (bytes, err) = collect(stream).await;

        assert!(err.is_none());
        assert_eq!(String::from_utf8(bytes).unwrap(), "Based on reviews...");
        assert_eq!(embedder.seen.lock().unwrap().as_slice(), &[question.to_string()]);
        assert_eq!(index.requested_k.lock().unwrap().as_slice(), &[3]);

        let sent = generator.received.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[0].content, SYSTEM_PROMPT);
        let last = &sent[1];
        assert_eq!(last.role, Role::User);
        assert!(last.content.starts_with(question));
        for (id, subject) in [("Dr. A", "Math"), ("Dr. B", "Math"), ("Dr. C", "Math")] {
            assert!(last.content.contains(&format!("Professor: {}", id)));
            assert!(last.content.contains(&format!("Subject: {}", subject)));
        }
    }

    #[tokio::test]
    async fn test_empty_conversation_makes_no_calls() {
        let embedder = Arc::new(FakeEmbedder::default());
        let index = Arc::new(FakeIndex::default());
        let generator = Arc::new(FakeGenerator::default());
        let pipeline = RagPipeline::new(embedder.clone(), index.clone(), generator.clone());

        let err = pipeline.answer(&[]).await.err().unwrap();
        assert!(matches!(err, Error::EmptyConversation));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(index.calls.load(Ordering::SeqCst), 0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_history_preserved_and_last_augmented() {
        let generator = Arc::new(FakeGenerator::default());
        let pipeline = RagPipeline::new(
            Arc::new(FakeEmbedder::default()),
            Arc::new(FakeIndex {
                matches: calculus_profs(),
                ..Default::default()
            }),
            generator.clone(),
        );

        let history = vec![
            ChatMessage::user("I need a stats professor"),
            ChatMessage::assistant("Which level?"),
            ChatMessage::system("Be brief."),
            ChatMessage::user("Intro level, please"),
        ];
        let stream = pipeline.answer(&history).await.unwrap();
        let _ = collect(stream).await;

        let sent = generator.received.lock().unwrap().clone();
        assert_eq!(sent.len(), history.len() + 1);
        assert_eq!(&sent[1..history.len()], &history[..history.len() - 1]);
        assert!(sent[history.len()].content.starts_with("Intro level, please\n\n"));
    }

    #[tokio::test]
    async fn test_fewer_matches_than_top_k() {
        let generator = Arc::new(FakeGenerator::default());
        let index = Arc::new(FakeIndex {
            matches: vec![prof("Dr. Only", "Art", 4.9)],
            ..Default::default()
        });
        let pipeline =
            RagPipeline::new(Arc::new(FakeEmbedder::default()), index.clone(), generator.clone());

        let stream = pipeline.answer(&[ChatMessage::user("art?")]).await.unwrap();
        let (bytes, err) = collect(stream).await;
        assert!(bytes.is_empty());
        assert!(err.is_none());

        assert_eq!(index.requested_k.lock().unwrap().as_slice(), &[3]);
        let sent = generator.received.lock().unwrap().clone();
        assert_eq!(sent[1].content.matches("Professor:").count(), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_request() {
        let index = Arc::new(FakeIndex::default());
        let generator = Arc::new(FakeGenerator::default());
        let pipeline = RagPipeline::new(
            Arc::new(FakeEmbedder {
                fail: true,
                ..Default::default()
            }),
            index.clone(),
            generator.clone(),
        );

        let err = pipeline.answer(&[ChatMessage::user("hi")]).await.err().unwrap();
        assert!(matches!(err, Error::Embedding(_)));
        assert_eq!(index.calls.load(Ordering::SeqCst), 0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mid_stream_error_keeps_prefix_and_stops() {
        let pipeline = RagPipeline::new(
            Arc::new(FakeEmbedder::default()),
            Arc::new(FakeIndex::default()),
            Arc::new(FakeGenerator {
                script: vec![
                    Scripted::Text("Dr. A is "),
                    Scripted::Fail("connection reset"),
                    Scripted::Text("never sent"),
                ],
                ..Default::default()
            }),
        );

        let stream = pipeline.answer(&[ChatMessage::user("hi")]).await.unwrap();
        let (bytes, err) = collect(stream).await;
        assert_eq!(bytes, b"Dr. A is ");
        assert!(matches!(err, Some(Error::Generation(_))));
    }

    #[tokio::test]
    async fn test_relay_skips_empty_deltas_in_order() {
        let chunks: ChunkStream = Box::pin(tokio_stream::iter(vec![
            Ok(GenerationChunk::empty()),
            Ok(GenerationChunk::text("a")),
            Ok(GenerationChunk::text("")),
            Ok(GenerationChunk::text("b")),
            Ok(GenerationChunk::empty()),
            Ok(GenerationChunk::text("c")),
        ]));

        let pieces: Vec<Bytes> = relay_deltas(chunks)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            pieces,
            vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
        );
    }

    #[tokio::test]
    async fn test_embedding_timeout() {
        let pipeline = RagPipeline::new(
            Arc::new(FakeEmbedder {
                delay: Some(Duration::from_millis(500)),
                ..Default::default()
            }),
            Arc::new(FakeIndex::default()),
            Arc::new(FakeGenerator::default()),
        )
        .with_timeouts(StageTimeouts {
            embed: Duration::from_millis(20),
            query: Duration::from_secs(1),
            generation: Duration::from_secs(1),
        });

        let err = pipeline.answer(&[ChatMessage::user("slow")]).await.err().unwrap();
        assert!(matches!(err, Error::Timeout { stage: "embedding", millis: 20 }));
    }

    fn short_timeouts() -> StageTimeouts {
        StageTimeouts {
            embed: Duration::from_millis(20),
            query: Duration::from_millis(20),
            generation: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_vector_query_timeout() {
        let generator = Arc::new(FakeGenerator::default());
        let pipeline = RagPipeline::new(
            Arc::new(FakeEmbedder::default()),
            Arc::new(FakeIndex {
                delay: Some(Duration::from_millis(500)),
                ..Default::default()
            }),
            generator.clone(),
        )
        .with_timeouts(short_timeouts());

        let err = pipeline.answer(&[ChatMessage::user("slow")]).await.err().unwrap();
        assert!(matches!(err, Error::Timeout { stage: "vector query", millis: 20 }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generation_open_timeout() {
        let pipeline = RagPipeline::new(
            Arc::new(FakeEmbedder::default()),
            Arc::new(FakeIndex::default()),
            Arc::new(FakeGenerator {
                script: vec![Scripted::Text("late")],
                delay: Some(Duration::from_millis(500)),
                ..Default::default()
            }),
        )
        .with_timeouts(short_timeouts());

        let err = pipeline.answer(&[ChatMessage::user("slow")]).await.err().unwrap();
        assert!(matches!(
            err,
            Error::Timeout { stage: "generation stream", millis: 20 }
        ));
    }

    #[test]
    fn test_from_config_requires_keys() {
        let mut config = ProfSageConfig::default();
        config.pinecone_api_key = Some("pc".into());
        assert!(matches!(
            RagPipeline::from_config(&config),
            Err(Error::MissingCredential("OPENAI_API_KEY"))
        ));

        config.openai_api_key = Some("sk".into());
        config.pinecone_api_key = None;
        assert!(matches!(
            RagPipeline::from_config(&config),
            Err(Error::MissingCredential("PINECONE_API_KEY"))
        ));

        config.pinecone_api_key = Some("pc".into());
        assert!(RagPipeline::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_retrieval_depth_is_fixed() {
        let index = Arc::new(FakeIndex {
            matches: (0..6).map(|i| prof(&format!("Dr. {}", i), "Math", 4.0)).collect(),
            ..Default::default()
        });
        let generator = Arc::new(FakeGenerator::default());
        let pipeline =
            RagPipeline::new(Arc::new(FakeEmbedder::default()), index.clone(), generator.clone());

        for _ in 0..2 {
            let stream = pipeline.answer(&[ChatMessage::user("math")]).await.unwrap();
            let _ = collect(stream).await;
        }

        assert_eq!(index.requested_k.lock().unwrap().as_slice(), &[TOP_K, TOP_K]);
        assert_eq!(TOP_K, 3);
        let sent = generator.received.lock().unwrap().clone();
        assert_eq!(sent[1].content.matches("Professor:").count(), 3);
    }
}
