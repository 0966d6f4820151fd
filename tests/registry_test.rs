#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hoplon::document::Document;
    use hoplon::engine::IndexReader;
    use hoplon::engine::segment::SegmentEngineConfig;
    use hoplon::lifecycle::{IndexState, LifecycleOptions};
    use hoplon::query::{Query, SearchPaging};
    use hoplon::registry::{DirectoryEngineFactory, IndexRegistry, MemoryEngineFactory};

    fn options() -> LifecycleOptions {
        LifecycleOptions {
            wait_interval: Duration::from_millis(5),
        }
    }

    fn memory_registry(max_open: usize) -> Arc<IndexRegistry> {
        IndexRegistry::new(Arc::new(MemoryEngineFactory::default()), options(), max_open)
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_least_recently_used_index_is_evicted() {
        let registry = memory_registry(3);

        // 1. open a, b, c in that order, then touch a again
        for id in ["a", "b", "c"] {
            registry.get_or_open(id).unwrap();
        }
        registry.get_or_open("a").unwrap();
        assert_eq!(registry.open_ids(), ids(&["a", "b", "c"]));

        // 2. opening d evicts b
        registry.get_or_open("d").unwrap();
        assert_eq!(registry.open_ids(), ids(&["a", "c", "d"]));
        assert_eq!(registry.get("b").unwrap().state(), IndexState::Closed);

        // 3. referencing b again brings it back and evicts c
        registry
            .get_or_open("b")
            .unwrap()
            .search(&Query::All, SearchPaging::default())
            .unwrap();
        assert_eq!(registry.open_ids(), ids(&["a", "b", "d"]));
    }

    #[test]
    fn test_eviction_keeps_data_and_leases() {
        let registry = memory_registry(1);
        let a = registry.get_or_open("a").unwrap();
        a.update_documents(None, vec![Document::builder().add_field("id", "1").build()])
            .unwrap();
        a.maybe_refresh().unwrap();
        let lease = a.book_searcher().unwrap();

        // a is the only candidate even though it is leased
        registry.get_or_open("b").unwrap();
        assert_eq!(a.state(), IndexState::Closed);
        assert_eq!(registry.open_ids(), ids(&["b"]));

        let results = lease.search(&Query::All, SearchPaging::default()).unwrap();
        assert_eq!(results.total_hits, 1);
        a.release_searcher(lease).unwrap();

        // the uncommitted write was committed by the eviction
        let again = registry.get_or_open("a").unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(
            again
                .search(&Query::All, SearchPaging::default())
                .unwrap()
                .total_hits,
            1
        );
    }

    #[test]
    fn test_closing_index_is_never_picked() {
        let registry = memory_registry(2);
        let a = registry.get_or_open("a").unwrap();
        registry.get_or_open("b").unwrap();
        a.stop().unwrap();

        registry.get_or_open("c").unwrap();
        assert_eq!(registry.open_ids(), ids(&["b", "c"]));
        registry.enforce_cap();
        assert_eq!(registry.open_count(), 2);
    }

    #[test]
    fn test_directory_registry_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(DirectoryEngineFactory::new(
            dir.path(),
            SegmentEngineConfig::default(),
        ));

        let registry = IndexRegistry::new(factory.clone(), options(), 10);
        let index = registry.get_or_open("books").unwrap();
        index
            .update_documents(None, vec![Document::builder().add_field("t", "x").build()])
            .unwrap();
        index.commit().unwrap();
        let stamped = registry.last_used("books").unwrap().unwrap();
        registry.stop_all().unwrap();
        assert_eq!(registry.open_count(), 0);

        let registry = IndexRegistry::new(factory, options(), 10);
        let recovered = registry.last_used("books").unwrap().unwrap();
        assert!(recovered <= stamped);
        assert!(recovered > 0);

        let index = registry.get_or_open("books").unwrap();
        let reader = index.book_reader().unwrap();
        assert_eq!(reader.doc_count(), 1);
        index.release_reader(reader).unwrap();
        assert!(index.last_used() >= recovered);
    }
}
