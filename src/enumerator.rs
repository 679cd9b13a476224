// src/enumerator.rs

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::api::{ContentSource, RemoteItem};
use crate::models::{DownloadableItem, EnumerationWarning, SourceKind};
use crate::paths::with_counter;

/// The outcome of listing one or more courses.
#[derive(Debug, Default)]
pub struct Enumeration {
    pub items: Vec<DownloadableItem>,
    pub warnings: Vec<EnumerationWarning>,
}

/// Enumerates every course in turn. Repeated course references are listed once.
pub async fn enumerate(
    source: &dyn ContentSource,
    course_refs: &[String],
    kinds: &[SourceKind],
) -> Enumeration {
    let mut seen = HashSet::new();
    let mut result = Enumeration::default();
    for course_ref in course_refs {
        if !seen.insert(course_ref.as_str()) {
            continue;
        }
        let course = enumerate_course(source, course_ref, kinds).await;
        result.items.extend(course.items);
        result.warnings.extend(course.warnings);
    }
    result
}

/// Lists one course, one query per source kind, in canonical kind order.
///
/// A failing kind yields no items and a warning; the other kinds still run.
pub async fn enumerate_course(
    source: &dyn ContentSource,
    course_ref: &str,
    kinds: &[SourceKind],
) -> Enumeration {
    let mut result = Enumeration::default();
    for kind in SourceKind::normalize(kinds) {
        match source.list_items(course_ref, kind).await {
            Ok(remote) => {
                let items = items_for_kind(course_ref, kind, remote);
                debug!(course = %course_ref, %kind, count = items.len(), "Enumerated source");
                result.items.extend(items);
            }
            Err(e) => {
                warn!(course = %course_ref, %kind, error = %e, "Skipping source");
                result.warnings.push(EnumerationWarning {
                    course_ref: course_ref.to_string(),
                    source_kind: kind,
                    detail: e.to_string(),
                });
            }
        }
    }
    result
}

fn items_for_kind(
    course_ref: &str,
    kind: SourceKind,
    remote: Vec<RemoteItem>,
) -> Vec<DownloadableItem> {
    let mut seen_ids = HashSet::new();
    let mut taken_names = HashSet::new();
    let mut items = Vec::with_capacity(remote.len());

    for remote_item in remote {
        if !remote_item.has_content {
            debug!(course = %course_ref, %kind, item_id = %remote_item.remote_id, "No content, excluded");
            continue;
        }
        if !seen_ids.insert(remote_item.remote_id.clone()) {
            continue;
        }

        let base = if remote_item.display_name.trim().is_empty() {
            format!("{}-{}", kind, remote_item.remote_id)
        } else {
            remote_item.display_name.trim().to_string()
        };
        let name = unique_name(&mut taken_names, &base);

        items.push(DownloadableItem {
            item_id: remote_item.remote_id,
            course_ref: course_ref.to_string(),
            source_kind: kind,
            suggested_name: name,
            size_hint: remote_item.size,
        });
    }
    items
}

fn unique_name(taken: &mut HashSet<String>, base: &str) -> String {
    if taken.insert(base.to_lowercase()) {
        return base.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = with_counter(base, n);
        if taken.insert(candidate.to_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RemoteError;
    use crate::testing::MockSource;

    fn names(items: &[DownloadableItem]) -> Vec<&str> {
        items.iter().map(|i| i.suggested_name.as_str()).collect()
    }

    #[tokio::test]
    async fn duplicate_names_are_suffixed_in_api_order() {
        let source = MockSource::new().with_items(
            "12345",
            SourceKind::Files,
            vec![
                RemoteItem::new("11", "a.pdf"),
                RemoteItem::new("12", "a.pdf"),
                RemoteItem::new("13", "a (1).pdf"),
            ],
        );
        let out = enumerate_course(&source, "12345", &[SourceKind::Files]).await;
        assert_eq!(names(&out.items), vec!["a.pdf", "a (1).pdf", "a (1) (1).pdf"]);
    }

    #[tokio::test]
    async fn kinds_follow_canonical_order() {
        let source = MockSource::new()
            .with_items("c", SourceKind::Pages, vec![RemoteItem::new("p", "page.html")])
            .with_items("c", SourceKind::Files, vec![RemoteItem::new("f", "file.pdf")]);
        let out = enumerate_course(&source, "c", &[SourceKind::Pages, SourceKind::Files]).await;
        let kinds: Vec<_> = out.items.iter().map(|i| i.source_kind).collect();
        assert_eq!(kinds, vec![SourceKind::Files, SourceKind::Pages]);
    }

    #[tokio::test]
    async fn items_without_content_are_excluded() {
        let source = MockSource::new().with_items(
            "c",
            SourceKind::Pages,
            vec![
                RemoteItem::new("empty", "empty.html").without_content(),
                RemoteItem::new("full", "full.html").with_size(10),
            ],
        );
        let out = enumerate_course(&source, "c", &[SourceKind::Pages]).await;
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].item_id, "full");
        assert_eq!(out.items[0].size_hint, Some(10));
    }

    #[tokio::test]
    async fn repeated_remote_ids_are_deduplicated() {
        let source = MockSource::new().with_items(
            "c",
            SourceKind::Files,
            vec![RemoteItem::new("1", "x.txt"), RemoteItem::new("1", "x.txt")],
        );
        let out = enumerate_course(&source, "c", &[SourceKind::Files]).await;
        assert_eq!(out.items.len(), 1);
    }

    #[tokio::test]
    async fn failing_kind_becomes_a_warning() {
        let source = MockSource::new()
            .with_items("c", SourceKind::Files, vec![RemoteItem::new("1", "x.txt")])
            .with_list_error(
                "c",
                SourceKind::Discussions,
                RemoteError::Forbidden("discussions disabled".into()),
            );
        let out = enumerate_course(&source, "c", &[]).await;
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].source_kind, SourceKind::Discussions);
    }

    #[tokio::test]
    async fn enumeration_is_reproducible() {
        let source = MockSource::new()
            .with_items(
                "c",
                SourceKind::Files,
                vec![RemoteItem::new("2", "b.txt"), RemoteItem::new("1", "b.txt")],
            )
            .with_items("d", SourceKind::Modules, vec![RemoteItem::new("9", "m.pdf")]);
        let courses = vec!["c".to_string(), "d".to_string(), "c".to_string()];
        let first = enumerate(&source, &courses, &[]).await;
        let second = enumerate(&source, &courses, &[]).await;
        assert_eq!(first.items, second.items);
        assert_eq!(first.items.len(), 3);
    }

    #[tokio::test]
    async fn blank_names_are_synthesized() {
        let source = MockSource::new().with_items(
            "c",
            SourceKind::Assignments,
            vec![RemoteItem::new("42", "  ")],
        );
        let out = enumerate_course(&source, "c", &[SourceKind::Assignments]).await;
        assert_eq!(out.items[0].suggested_name, "assignments-42");
    }
}
