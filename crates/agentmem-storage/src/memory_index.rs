//! Full-text search index over memory content, backed by tantivy.
//!
//! The index is derived data: memory rows in [`crate::memory`] stay
//! authoritative, and [`MemoryIndex::rebuild`] can regenerate everything
//! from them. Queries combine terms with OR, so a multi-keyword search
//! matches memories containing any of the keywords, ranked by relevance.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tantivy::collector::TopDocs;
use tantivy::doc;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, INDEXED, IndexRecordOption, STORED, STRING, Schema, TEXT, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use crate::error::Result;
use crate::memory::MemoryRecord;

/// The slice of a memory row that gets indexed.
#[derive(Debug, Clone)]
pub struct IndexableMemory {
    pub id: u64,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub content: String,
}

impl From<&MemoryRecord> for IndexableMemory {
    fn from(record: &MemoryRecord) -> Self {
        Self {
            id: record.id,
            agent_id: record.agent_id.clone(),
            session_id: record.session_id.clone(),
            content: record.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    pub id: u64,
    pub relevance: f32,
}

pub struct MemoryIndex {
    index: Index,
    reader: IndexReader,
    writer: Arc<Mutex<IndexWriter>>,
    memory_id_field: Field,
    agent_id_field: Field,
    session_id_field: Field,
    content_field: Field,
}

impl MemoryIndex {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create index dir: {}", path.display()))?;

        let schema = build_schema();
        let index = Index::open_in_dir(path).or_else(|_| Index::create_in_dir(path, schema))?;
        Self::from_index(index)
    }

    pub fn in_memory() -> Result<Self> {
        let schema = build_schema();
        let index = Index::create_in_ram(schema);
        Self::from_index(index)
    }

    pub fn doc_count(&self) -> Result<u64> {
        Ok(self.reader.searcher().num_docs())
    }

    /// Add or replace one memory in the index.
    pub fn index_memory(&self, memory: &IndexableMemory) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_u64(self.memory_id_field, memory.id));

        writer.add_document(self.to_document(memory))?;
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Drop the given memory ids from the index in one commit.
    pub fn remove_many(&self, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut writer = self.writer.lock();
        for id in ids {
            writer.delete_term(Term::from_field_u64(self.memory_id_field, *id));
        }
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Relevance-ranked memory ids matching `query` for one agent.
    ///
    /// Query terms combine with OR; a memory matching more terms ranks
    /// higher. `session_id` narrows the match to that session's memories;
    /// without it, session-scoped and agent-global memories both match.
    pub fn search(
        &self,
        query: &str,
        agent_id: &str,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        let searcher = self.reader.searcher();

        let parser = QueryParser::for_index(&self.index, vec![self.content_field]);
        let text_query = parser.parse_query(query).map_err(anyhow::Error::new)?;

        let agent_term = Term::from_field_text(self.agent_id_field, agent_id);
        let agent_query = TermQuery::new(agent_term, IndexRecordOption::Basic);

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![
            (Occur::Must, text_query),
            (Occur::Must, Box::new(agent_query)),
        ];
        if let Some(session_id) = session_id {
            let session_term = Term::from_field_text(self.session_id_field, session_id);
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(session_term, IndexRecordOption::Basic)),
            ));
        }
        let combined = BooleanQuery::new(clauses);

        let top_docs = searcher.search(&combined, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (relevance, address) in top_docs {
            let document: TantivyDocument = searcher.doc(address)?;
            let Some(value) = document.get_first(self.memory_id_field) else {
                continue;
            };
            let Some(id) = value.as_u64() else {
                continue;
            };
            hits.push(MemoryHit { id, relevance });
        }

        Ok(hits)
    }

    /// Drop every document and re-index from scratch, returning how many
    /// memories were indexed.
    pub fn rebuild<I>(&self, memories: I) -> Result<usize>
    where
        I: IntoIterator<Item = IndexableMemory>,
    {
        let mut writer = self.writer.lock();
        writer.delete_all_documents()?;

        let mut count = 0usize;
        for memory in memories {
            writer.add_document(self.to_document(&memory))?;
            count += 1;
        }

        writer.commit()?;
        self.reader.reload()?;
        Ok(count)
    }

    fn to_document(&self, memory: &IndexableMemory) -> TantivyDocument {
        let mut document = doc!(
            self.memory_id_field => memory.id,
            self.agent_id_field => memory.agent_id.clone(),
            self.content_field => memory.content.clone(),
        );
        // Agent-global memories carry no session field at all
        if let Some(session_id) = &memory.session_id {
            document.add_text(self.session_id_field, session_id);
        }
        document
    }

    fn from_index(index: Index) -> Result<Self> {
        let schema = index.schema();
        let memory_id_field = schema
            .get_field("memory_id")
            .context("missing memory_id field in index schema")?;
        let agent_id_field = schema
            .get_field("agent_id")
            .context("missing agent_id field in index schema")?;
        let session_id_field = schema
            .get_field("session_id")
            .context("missing session_id field in index schema")?;
        let content_field = schema
            .get_field("content")
            .context("missing content field in index schema")?;

        let writer = index.writer(50_000_000)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            memory_id_field,
            agent_id_field,
            session_id_field,
            content_field,
        })
    }
}

fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    schema_builder.add_u64_field("memory_id", INDEXED | STORED);
    schema_builder.add_text_field("agent_id", STRING);
    schema_builder.add_text_field("session_id", STRING);
    schema_builder.add_text_field("content", TEXT);
    schema_builder.build()
}
