#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::TryStreamExt;
use kmem_core::memory::{MemoryFilter, MemoryRecord};
use lopdf::{Document, Object, Stream, dictionary};
use tempfile::TempDir;

use kmem_pipeline::{
    CancelSignal, DecoderRegistry, EmbeddingGenerator, FileSystemArtifactStore, HandlerContext,
    InMemoryQueue, MemoryDb, MemoryService, PipelineError, PipelineQueue, PipelineResult,
    QueueOptions, ServiceOptions, SimpleMemoryDb, StepDisposition,
};

/// Embeds text as `[len, 1, 0.5]`. Texts containing a fail marker are
/// rejected with a transient error.
pub struct TestEmbedder {
    fail_markers: Vec<String>,
    pub calls: AtomicUsize,
}

impl TestEmbedder {
    pub fn new() -> Self {
        Self::failing_on(&[])
    }

    pub fn failing_on(markers: &[&str]) -> Self {
        Self {
            fail_markers: markers.iter().map(|m| m.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingGenerator for TestEmbedder {
    fn provider_name(&self) -> &str {
        "test/embedder"
    }

    fn max_tokens(&self) -> usize {
        2048
    }

    fn max_batch_size(&self) -> usize {
        16
    }

    async fn generate_embedding(&self, text: &str) -> PipelineResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_markers.iter().any(|m| text.contains(m.as_str())) {
            return Err(PipelineError::Embedding("upstream unavailable".to_string()));
        }
        Ok(vec![text.len() as f32, 1.0, 0.5])
    }
}

pub struct TestService {
    pub dir: TempDir,
    pub service: MemoryService,
    pub db: Arc<dyn MemoryDb>,
    pub queue: Arc<dyn PipelineQueue>,
    pub embedder: Arc<TestEmbedder>,
}

pub struct Builder {
    embedder: TestEmbedder,
    db: Option<Arc<dyn MemoryDb>>,
    queue: Option<Arc<dyn PipelineQueue>>,
    options: ServiceOptions,
}

pub fn builder() -> Builder {
    Builder {
        embedder: TestEmbedder::new(),
        db: None,
        queue: None,
        options: ServiceOptions::default(),
    }
}

impl Builder {
    pub fn embedder(mut self, embedder: TestEmbedder) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn db(mut self, db: Arc<dyn MemoryDb>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn PipelineQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn options(mut self, f: impl FnOnce(&mut ServiceOptions)) -> Self {
        f(&mut self.options);
        self
    }

    pub async fn build(self) -> TestService {
        let dir = TempDir::new().unwrap();
        self.build_in(dir).await
    }

    /// Build over an existing artifact directory, as a restarted process
    /// would.
    pub async fn build_in(self, dir: TempDir) -> TestService {
        let db = self
            .db
            .unwrap_or_else(|| Arc::new(SimpleMemoryDb::new()) as Arc<dyn MemoryDb>);
        let queue = self.queue.unwrap_or_else(|| {
            Arc::new(InMemoryQueue::new(QueueOptions::default())) as Arc<dyn PipelineQueue>
        });
        let embedder = Arc::new(self.embedder);
        let context = HandlerContext {
            artifacts: Arc::new(FileSystemArtifactStore::open(dir.path()).await.unwrap()),
            decoders: Arc::new(DecoderRegistry::with_defaults()),
            embedder: Arc::clone(&embedder) as Arc<dyn EmbeddingGenerator>,
            memory_dbs: vec![Arc::clone(&db)],
        };
        let service = MemoryService::new(context, Arc::clone(&queue), self.options);
        TestService {
            dir,
            service,
            db,
            queue,
            embedder,
        }
    }
}

impl TestService {
    /// Process messages until none is ready; returns every disposition.
    pub async fn drain(&self) -> Vec<StepDisposition> {
        let mut dispositions = Vec::new();
        while let Some(disposition) = self
            .service
            .orchestrator()
            .run_once(&CancelSignal::never())
            .await
            .unwrap()
        {
            dispositions.push(disposition);
        }
        dispositions
    }

    pub async fn records_of(&self, index: &str, document_id: &str) -> Vec<MemoryRecord> {
        let filters = [MemoryFilter::by_document(document_id)];
        match self.db.get_list(index, &filters, None).try_collect().await {
            Ok(records) => records,
            Err(PipelineError::IndexNotFound(_)) => Vec::new(),
            Err(err) => panic!("listing records failed: {err}"),
        }
    }

    pub fn document_dir(&self, index: &str, document_id: &str) -> std::path::PathBuf {
        self.dir.path().join(index).join(document_id)
    }
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// A PDF with one page per entry of `pages`.
pub fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.4");
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let pages_id = doc.new_object_id();

    let mut kids = Vec::new();
    for text in pages {
        let content = format!("BT /F1 12 Tf 72 720 Td ({text}) Tj ET");
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        });
        kids.push(Object::from(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}
