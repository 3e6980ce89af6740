//! In-memory stream directory.
//!
//! The grid supervisor only reads the ordered list; slot `i` of the grid
//! hosts `list()[i]`.  Mutations come from clients (socket / HTTP).

use crate::protocol::StreamDescriptor;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct StreamDirectory {
    streams: Vec<StreamDescriptor>,
}

impl StreamDirectory {
    pub fn new(seed: Vec<StreamDescriptor>) -> Self {
        let mut dir = Self::default();
        dir.import(seed);
        dir
    }

    pub fn list(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn get(&self, id: &str) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.id == id)
    }

    /// Append a new stream with a fresh id.
    pub fn add(&mut self, title: String, url: String) -> StreamDescriptor {
        let id = self.fresh_id(chrono::Utc::now().timestamp_millis());
        let stream = StreamDescriptor { id, title, url };
        debug!("streams: add {:?}", stream);
        self.streams.push(stream.clone());
        stream
    }

    /// Replace the entry with the same id.  Returns false when no entry matched.
    pub fn update(&mut self, stream: StreamDescriptor) -> bool {
        match self.streams.iter_mut().find(|s| s.id == stream.id) {
            Some(slot) => {
                debug!("streams: update {:?}", stream);
                *slot = stream;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<StreamDescriptor> {
        let pos = self.streams.iter().position(|s| s.id == id)?;
        debug!("streams: remove {}", id);
        Some(self.streams.remove(pos))
    }

    /// Append a batch.  Entries with an empty or already-taken id get a fresh one.
    pub fn import(&mut self, streams: Vec<StreamDescriptor>) -> usize {
        let base = chrono::Utc::now().timestamp_millis();
        let count = streams.len();
        for mut stream in streams {
            if stream.id.is_empty() || self.get(&stream.id).is_some() {
                stream.id = self.fresh_id(base);
            }
            self.streams.push(stream);
        }
        count
    }

    fn fresh_id(&self, millis: i64) -> String {
        let mut candidate = millis;
        loop {
            let id = candidate.to_string();
            if self.get(&id).is_none() {
                return id;
            }
            candidate += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(id: &str, url: &str) -> StreamDescriptor {
        StreamDescriptor {
            id: id.to_string(),
            title: format!("title {}", id),
            url: url.to_string(),
        }
    }

    #[test]
    fn add_assigns_unique_ids() {
        let mut dir = StreamDirectory::default();
        let a = dir.add("A".into(), "https://a/index.m3u8".into());
        let b = dir.add("B".into(), "https://b/index.m3u8".into());
        assert_ne!(a.id, b.id);
        assert_eq!(dir.list().len(), 2);
        assert_eq!(dir.list()[1].title, "B");
    }

    #[test]
    fn update_and_remove_by_id() {
        let mut dir = StreamDirectory::new(vec![stream("1", "u1"), stream("2", "u2")]);
        assert!(dir.update(stream("2", "u2-new")));
        assert!(!dir.update(stream("9", "nope")));
        assert_eq!(dir.get("2").map(|s| s.url.as_str()), Some("u2-new"));

        let removed = dir.remove("1").unwrap();
        assert_eq!(removed.url, "u1");
        assert!(dir.remove("1").is_none());
        assert_eq!(dir.list().len(), 1);
    }

    #[test]
    fn import_appends_and_dedups_ids() {
        let mut dir = StreamDirectory::new(vec![stream("1", "u1")]);
        let added = dir.import(vec![stream("1", "dup"), stream("", "blank"), stream("7", "u7")]);
        assert_eq!(added, 3);
        assert_eq!(dir.list().len(), 4);
        let ids: Vec<&str> = dir.list().iter().map(|s| s.id.as_str()).collect();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(dir.list()[3].id, "7");
    }
}
