//! Flattened module enumeration across every execution context.

use crate::{ExecutionContext, ModuleStream, RawModuleRecord, Result, RuntimeSession};

fn has_name(record: &RawModuleRecord) -> bool {
    record
        .identity
        .as_deref()
        .and_then(|identity| identity.split(',').next())
        .is_some_and(|name| !name.trim().is_empty())
}

/// Single-pass iterator over the modules of all execution contexts of one
/// runtime, in context order.
///
/// Records that fail to read, or whose identity has no assembly name, are
/// skipped and counted rather than surfaced.
pub struct ModuleEnumerator<'a> {
    session: &'a dyn RuntimeSession,
    contexts: std::vec::IntoIter<ExecutionContext>,
    current: Option<ModuleStream<'a>>,
    skipped: usize,
}

impl<'a> ModuleEnumerator<'a> {
    /// Fails only if the context list itself cannot be read.
    pub fn new(session: &'a dyn RuntimeSession) -> Result<Self> {
        let contexts = session.contexts()?;
        tracing::debug!(count = contexts.len(), "Enumerating execution contexts");

        Ok(Self {
            session,
            contexts: contexts.into_iter(),
            current: None,
            skipped: 0,
        })
    }

    /// Number of records dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for ModuleEnumerator<'_> {
    type Item = RawModuleRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(stream) = self.current.as_mut() {
                match stream.next() {
                    Some(Ok(record)) if has_name(&record) => return Some(record),
                    Some(Ok(record)) => {
                        tracing::debug!(
                            base_address = record.base_address,
                            "Skipping module without assembly name"
                        );
                        self.skipped += 1;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Skipping unreadable module record");
                        self.skipped += 1;
                    }
                    None => self.current = None,
                }
                continue;
            }

            let context = self.contexts.next()?;
            tracing::debug!(id = context.id, name = %context.name, "Walking execution context");
            self.current = Some(self.session.modules(&context));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    /// Contexts in order; `None` entries are unreadable records.
    struct ScriptedSession(Vec<Vec<Option<&'static str>>>);

    impl RuntimeSession for ScriptedSession {
        fn contexts(&self) -> Result<Vec<ExecutionContext>> {
            Ok((0..self.0.len())
                .map(|i| ExecutionContext {
                    id: i as u64,
                    name: format!("domain{}", i),
                })
                .collect())
        }

        fn modules(&self, context: &ExecutionContext) -> ModuleStream<'_> {
            Box::new(self.0[context.id as usize].iter().map(|entry| match entry {
                Some(identity) => Ok(RawModuleRecord::new(*identity, 0x1000, "/app/x.dll")),
                None => Err(Error::RecordRead("gone".into())),
            }))
        }
    }

    struct BrokenSession;

    impl RuntimeSession for BrokenSession {
        fn contexts(&self) -> Result<Vec<ExecutionContext>> {
            Err(Error::EnumerationFailed("no domain store".into()))
        }

        fn modules(&self, _context: &ExecutionContext) -> ModuleStream<'_> {
            Box::new(std::iter::empty())
        }
    }

    fn identities(enumerator: ModuleEnumerator<'_>) -> Vec<String> {
        enumerator.filter_map(|r| r.identity).collect()
    }

    #[test]
    fn flattens_contexts_in_order() {
        let session = ScriptedSession(vec![vec![Some("A"), Some("B")], vec![], vec![Some("A"), Some("C")]]);
        let enumerator = ModuleEnumerator::new(&session).unwrap();
        assert_eq!(identities(enumerator), vec!["A", "B", "A", "C"]);
    }

    #[test]
    fn skips_and_counts_unreadable_records() {
        let session = ScriptedSession(vec![vec![None, Some("A")], vec![None, None, Some("B")]]);
        let mut enumerator = ModuleEnumerator::new(&session).unwrap();
        let records: Vec<RawModuleRecord> = enumerator.by_ref().collect();

        assert_eq!(records.len(), 2);
        assert_eq!(enumerator.skipped(), 3);
    }

    #[test]
    fn blank_names_are_skipped_and_counted() {
        let session = ScriptedSession(vec![vec![
            Some(""),
            Some("   "),
            Some(" , Version=1.0.0.0, Culture=neutral"),
            Some("Plugin, Version=1.0.0.0"),
        ]]);
        let mut enumerator = ModuleEnumerator::new(&session).unwrap();
        let records: Vec<RawModuleRecord> = enumerator.by_ref().collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity.as_deref(), Some("Plugin, Version=1.0.0.0"));
        assert_eq!(enumerator.skipped(), 3);
    }

    #[test]
    fn context_list_failure_is_an_error() {
        assert!(matches!(
            ModuleEnumerator::new(&BrokenSession),
            Err(Error::EnumerationFailed(_))
        ));
    }
}
