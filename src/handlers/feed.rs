use futures::stream::{self, BoxStream, StreamExt};
use serde::de::{Deserializer as _, SeqAccess, Visitor};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;

use crate::models::*;

/// Channel depth between the blocking JSON parser and the async consumer.
const FEED_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    /// One top-level JSON array of product objects.
    JsonArray,
    /// One product object per line.
    JsonLines,
}

impl FeedFormat {
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()) {
            Some(ext) if ext == "jsonl" || ext == "ndjson" => FeedFormat::JsonLines,
            _ => FeedFormat::JsonArray,
        }
    }
}

/// Lazy reader over a bulk product feed on disk. The file is parsed
/// incrementally and never held in memory as a whole; each call to
/// [`FeedReader::stream`] starts a fresh pass from the beginning.
///
/// An entry that is valid JSON but not a product object yields an `Err` item
/// and reading continues. A syntax error ends the stream after one `Err`.
#[derive(Debug, Clone)]
pub struct FeedReader {
    path: PathBuf,
    format: FeedFormat,
}

impl FeedReader {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = FeedFormat::detect(&path);
        Self { path, format }
    }

    pub fn with_format(path: impl Into<PathBuf>, format: FeedFormat) -> Self {
        Self { path: path.into(), format }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> FeedFormat {
        self.format
    }

    pub fn stream(&self) -> BoxStream<'static, Result<RawProduct>> {
        tracing::debug!(path = %self.path.display(), format = ?self.format, "Opening product feed");
        match self.format {
            FeedFormat::JsonArray => json_array_stream(self.path.clone()),
            FeedFormat::JsonLines => json_lines_stream(self.path.clone()),
        }
    }
}

struct ArrayVisitor<'a> {
    tx: &'a mpsc::Sender<Result<RawProduct>>,
}

impl<'de, 'a> Visitor<'de> for ArrayVisitor<'a> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a JSON array of product objects")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some(value) = seq.next_element::<serde_json::Value>()? {
            let item = serde_json::from_value::<RawProduct>(value).map_err(CatalogError::from);
            if self.tx.blocking_send(item).is_err() {
                // Consumer went away; stop parsing.
                return Ok(());
            }
        }
        Ok(())
    }
}

fn json_array_stream(path: PathBuf) -> BoxStream<'static, Result<RawProduct>> {
    let (tx, rx) = mpsc::channel::<Result<RawProduct>>(FEED_BUFFER);

    tokio::task::spawn_blocking(move || {
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                let _ = tx.blocking_send(Err(e.into()));
                return;
            }
        };
        let mut de = serde_json::Deserializer::from_reader(std::io::BufReader::new(file));
        if let Err(e) = (&mut de).deserialize_seq(ArrayVisitor { tx: &tx }) {
            if !tx.is_closed() {
                tracing::warn!(path = %path.display(), error = %e, "Product feed is malformed; stopping");
                let _ = tx.blocking_send(Err(e.into()));
            }
        }
    });

    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

enum LinesState {
    Pending(PathBuf),
    Open(Lines<BufReader<tokio::fs::File>>),
    Done,
}

fn json_lines_stream(path: PathBuf) -> BoxStream<'static, Result<RawProduct>> {
    stream::unfold(LinesState::Pending(path), |state| async move {
        let mut lines = match state {
            LinesState::Pending(path) => match tokio::fs::File::open(&path).await {
                Ok(file) => BufReader::new(file).lines(),
                Err(e) => return Some((Err(e.into()), LinesState::Done)),
            },
            LinesState::Open(lines) => lines,
            LinesState::Done => return None,
        };
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let item = serde_json::from_str::<RawProduct>(&line).map_err(CatalogError::from);
                    return Some((item, LinesState::Open(lines)));
                }
                Ok(None) => return None,
                Err(e) => return Some((Err(e.into()), LinesState::Done)),
            }
        }
    })
    .boxed()
}
