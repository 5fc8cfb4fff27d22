use super::protos::*;

/// In-memory store for the replicated log.
///
/// Index 0 always holds a sentinel entry with term 0. It is never applied and
/// never leaves this server; its only purpose is to make the prev-log
/// consistency check uniform at the head of the log.
pub struct Log {
	entries: Vec<LogEntry>,
}

impl Log {
	pub fn new() -> Log {
		Log {
			entries: vec![LogEntry {
				index: 0,
				term: 0,
				data: vec![],
			}],
		}
	}

	/// Rebuilds a log from previously persisted entries (the sentinel is not
	/// persisted and is recreated here).
	pub fn from_entries(entries: Vec<LogEntry>) -> Log {
		let mut log = Log::new();
		log.entries.extend(entries);
		log
	}

	pub fn last_index(&self) -> LogIndex {
		(self.entries.len() - 1) as LogIndex
	}

	pub fn last_term(&self) -> Term {
		self.entries[self.entries.len() - 1].term
	}

	/// Term of the entry at the given index, or None if the index is beyond
	/// the end of the log.
	pub fn term(&self, index: LogIndex) -> Option<Term> {
		self.entries.get(index as usize).map(|e| e.term)
	}

	pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
		if index == 0 {
			return None;
		}

		self.entries.get(index as usize)
	}

	/// Copies out all entries at and after the given index, for shipping in an
	/// AppendEntries request.
	pub fn slice(&self, from: LogIndex) -> Vec<LogEntry> {
		if from as usize >= self.entries.len() {
			return vec![];
		}

		self.entries[(from as usize)..].to_vec()
	}

	pub fn append(&mut self, entry: LogEntry) {
		debug_assert_eq!(entry.index, self.last_index() + 1);
		self.entries.push(entry);
	}

	/// Drops every entry at and after the given index. The sentinel can never
	/// be truncated.
	pub fn truncate_suffix(&mut self, from: LogIndex) {
		debug_assert!(from > 0);
		self.entries.truncate(from as usize);
	}

	/// All real entries, for persistence.
	pub fn persisted_entries(&self) -> Vec<LogEntry> {
		self.entries[1..].to_vec()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(index: LogIndex, term: Term) -> LogEntry {
		LogEntry {
			index,
			term,
			data: vec![index as u8],
		}
	}

	#[test]
	fn empty_log_has_sentinel() {
		let log = Log::new();
		assert_eq!(log.last_index(), 0);
		assert_eq!(log.last_term(), 0);
		assert_eq!(log.term(0), Some(0));
		assert_eq!(log.term(1), None);
		assert!(log.entry(0).is_none());
	}

	#[test]
	fn append_and_lookup() {
		let mut log = Log::new();
		log.append(entry(1, 1));
		log.append(entry(2, 3));

		assert_eq!(log.last_index(), 2);
		assert_eq!(log.last_term(), 3);
		assert_eq!(log.term(1), Some(1));
		assert_eq!(log.term(2), Some(3));
		assert_eq!(log.entry(2).map(|e| e.term), Some(3));
	}

	#[test]
	fn slice_copies_the_suffix() {
		let mut log = Log::new();
		for i in 1..=4 {
			log.append(entry(i, 1));
		}

		let suffix = log.slice(3);
		assert_eq!(suffix.len(), 2);
		assert_eq!(suffix[0].index, 3);
		assert_eq!(suffix[1].index, 4);
		assert!(log.slice(5).is_empty());
	}

	#[test]
	fn truncate_drops_the_suffix() {
		let mut log = Log::new();
		for i in 1..=3 {
			log.append(entry(i, 1));
		}

		log.truncate_suffix(2);
		assert_eq!(log.last_index(), 1);
		assert_eq!(log.term(2), None);
	}

	#[test]
	fn restore_round_trip() {
		let mut log = Log::new();
		log.append(entry(1, 1));
		log.append(entry(2, 2));

		let restored = Log::from_entries(log.persisted_entries());
		assert_eq!(restored.last_index(), 2);
		assert_eq!(restored.term(1), Some(1));
		assert_eq!(restored.term(2), Some(2));
	}
}
