//! End-to-end runs of whole stories against a scripted provider.

use crate::integration::support::{fast_config, story, Harness, REFERENCE_PROMPT};
use picturebook::error::PipelineError;
use picturebook::progress::PipelineEvent;
use picturebook::references::ReferencesConfig;
use picturebook::store::{PageStore, TaskRecordStore};
use picturebook::task::{IllustrationStatus, TaskStatus, TaskType};
use picturebook::types::{now_millis, CollectionId, StoryId};
use picturebook::visual::CollectionVisualContext;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;

fn drain(rx: &mut Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn started_types(events: &[PipelineEvent]) -> Vec<TaskType> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::TaskStarted { task_type, .. } => Some(*task_type),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_three_page_story_with_characters() {
    let harness = Harness::new();
    let mut rx = harness.engine.subscribe();

    let ids = harness.engine.submit_story(story("s1", 3, true), None).unwrap();
    assert_eq!(ids.len(), 4);
    let tasks = harness.engine.story_tasks(&StoryId::new("s1"));
    assert_eq!(
        tasks.iter().filter(|t| t.task_type == TaskType::GlobalReference).count(),
        1
    );

    let snapshot = harness.engine.run_story(&StoryId::new("s1")).await.unwrap();
    assert_eq!(snapshot.ready, 3);
    assert_eq!(snapshot.total, 3);
    assert_eq!(snapshot.label(), "3 of 3 illustrations ready");

    let events = drain(&mut rx);
    let started = started_types(&events);
    assert_eq!(started.len(), 4);
    assert_eq!(started[0], TaskType::GlobalReference);
    assert!(started[1..].iter().all(|t| *t == TaskType::PageIllustration));

    let calls = harness.provider.calls();
    assert!(calls[0].prompt.starts_with(REFERENCE_PROMPT));
    for call in harness.provider.page_calls() {
        assert!(call.reference_labels.contains(&"global_reference".to_string()));
        assert!(call.prompt.contains("Milo is a grey kitten with a blue bell in the reference image"));
    }
    let page_calls = harness.provider.page_calls();
    assert!(!page_calls[0].reference_labels.contains(&"previous_page".to_string()));
    assert!(page_calls[1].reference_labels.contains(&"previous_page".to_string()));

    for page in harness.pages("s1") {
        assert_eq!(page.illustration_status, IllustrationStatus::Ready);
        assert!(page.illustration().is_some());
        assert!(!page.degraded);
    }

    let story = harness.store.get_story(&StoryId::new("s1")).unwrap().unwrap();
    assert!(story.visual_guide.has_global_reference());
    assert!(!story.references_pending);

    // Committed tasks leave the durable store.
    let (records, _) = harness.store.list_tasks().unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_story_without_characters_skips_references() {
    let harness = Harness::new();
    let ids = harness.engine.submit_story(story("plain", 2, false), None).unwrap();
    assert_eq!(ids.len(), 2);

    harness.engine.run_story(&StoryId::new("plain")).await.unwrap();
    assert_eq!(harness.provider.call_count(), 2);
    assert!(harness.provider.calls().iter().all(|c| !c.prompt.starts_with(REFERENCE_PROMPT)));
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let harness = Harness::new();
    let mut rx = harness.engine.subscribe();
    harness
        .provider
        .fail_next(2, PipelineError::ProviderTimeout("slow".to_string()));

    harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    let snapshot = harness.engine.run_story(&StoryId::new("s1")).await.unwrap();
    assert!(snapshot.is_complete());
    assert_eq!(harness.provider.call_count(), 3);

    let events = drain(&mut rx);
    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::TaskStarted { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    // The third attempt starts with two recorded failures.
    assert_eq!(attempts, vec![1, 2, 3]);
    let failures = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::TaskFailed { .. }))
        .count();
    assert_eq!(failures, 2);
    let ready: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::TaskReady { attempt_count, .. } => Some(*attempt_count),
            _ => None,
        })
        .collect();
    assert_eq!(ready, vec![2]);
}

#[tokio::test]
async fn test_permanent_failure_is_abandoned_after_budget() {
    let harness = Harness::new();
    let mut rx = harness.engine.subscribe();
    harness.provider.always_fail("Page 1 text");

    let ids = harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    let snapshot = harness.engine.run_story(&StoryId::new("s1")).await.unwrap();
    assert_eq!(snapshot.ready, 0);
    assert_eq!(harness.provider.call_count(), 3);

    let task = harness.engine.task(&ids[0]).unwrap();
    assert_eq!(task.status, TaskStatus::Abandoned);
    assert_eq!(task.attempt_count, 3);
    assert!(task.last_error.is_some());

    let record = harness.store.get_task(&ids[0]).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Abandoned);

    let page = &harness.pages("s1")[0];
    assert_eq!(page.illustration_status, IllustrationStatus::Failed);
    assert!(page.illustration().is_none());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::TaskAbandoned { .. })));
    assert_eq!(harness.engine.stats().abandoned, 1);
}

#[tokio::test]
async fn test_abandoned_page_releases_later_pages() {
    let harness = Harness::new();
    harness.provider.always_fail("Page 1 text");

    let ids = harness.engine.submit_story(story("s1", 4, false), None).unwrap();
    let snapshot = harness.engine.run_story(&StoryId::new("s1")).await.unwrap();
    assert_eq!(snapshot.ready, 3);
    assert_eq!(snapshot.total, 4);
    assert_eq!(harness.provider.call_count(), 6);
    assert_eq!(harness.engine.task(&ids[0]).unwrap().status, TaskStatus::Abandoned);

    let pages = harness.pages("s1");
    assert_eq!(pages[0].illustration_status, IllustrationStatus::Failed);
    for page in &pages[1..] {
        assert_eq!(page.illustration_status, IllustrationStatus::Ready);
        assert!(page.illustration().is_some());
    }
    // Only the page that lost its continuity image is degraded.
    assert!(pages[1].degraded);
    assert!(!pages[2].degraded);
    assert!(!pages[3].degraded);

    let calls = harness.provider.page_calls();
    assert!(!calls[3].reference_labels.contains(&"previous_page".to_string()));
    assert!(calls[4].reference_labels.contains(&"previous_page".to_string()));

    // Only the abandoned task remains durable.
    let (records, _) = harness.store.list_tasks().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, ids[0]);
}

#[tokio::test]
async fn test_collection_stories_share_character_descriptions() {
    let harness = Harness::new();
    let collection = CollectionVisualContext {
        collection_id: CollectionId::new("bedtime"),
        theme: "friendship".to_string(),
        shared_characters: ["Milo: a grey kitten with a blue bell".to_string()]
            .into_iter()
            .collect(),
        unified_art_style: "pastel gouache".to_string(),
        developmental_focus: "sharing".to_string(),
        age_group: "3-5".to_string(),
        requires_character_consistency: true,
        allows_style_variation: false,
        shared_props: Default::default(),
    };

    let mut first = story("first", 2, true);
    first.characters.insert("Milo".to_string(), "an orange cat".to_string());
    let mut second = story("second", 2, true);
    second.characters.insert("Milo".to_string(), "a fluffy white kitten".to_string());

    harness.engine.submit_story(first, Some(&collection)).unwrap();
    harness.engine.submit_story(second, Some(&collection)).unwrap();

    let shared = collection.shared_character_definitions()["Milo"].clone();
    for id in ["first", "second"] {
        let record = harness.store.get_story(&StoryId::new(id)).unwrap().unwrap();
        assert_eq!(record.visual_guide.character_description("Milo"), Some(shared.as_str()));
        assert_eq!(record.visual_guide.style_guide, "pastel gouache");
        assert_eq!(record.collection_id, Some(CollectionId::new("bedtime")));
    }
    assert!(harness
        .store
        .get_collection(&CollectionId::new("bedtime"))
        .unwrap()
        .is_some());

    let results = harness.engine.run_all().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.as_ref().map(|s| s.is_complete()).unwrap_or(false)));
    for call in harness.provider.page_calls() {
        assert!(call.prompt.contains(&shared));
        assert!(!call.prompt.contains("orange cat"));
    }
}

#[tokio::test]
async fn test_reference_failure_degrades_pages_and_clears_notice() {
    let references = ReferencesConfig {
        notice_ttl_ms: 1_000,
        ..ReferencesConfig::default()
    };
    let harness = Harness::with_config(fast_config(), references);
    let mut rx = harness.engine.subscribe();
    harness.provider.always_fail(REFERENCE_PROMPT);

    harness.engine.submit_story(story("s1", 2, true), None).unwrap();
    let snapshot = harness.engine.run_story(&StoryId::new("s1")).await.unwrap();
    assert!(snapshot.is_complete());

    for page in harness.pages("s1") {
        assert!(page.degraded);
    }
    for call in harness.provider.page_calls() {
        assert!(!call.reference_labels.contains(&"global_reference".to_string()));
    }

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::ReferencesFailed { .. })));
    let story_id = StoryId::new("s1");
    assert!(harness.engine.notices().visible(&story_id, now_millis()).is_some());

    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert!(harness.engine.notices().visible(&story_id, now_millis()).is_none());
    let later = drain(&mut rx);
    assert!(later.iter().any(|e| matches!(e, PipelineEvent::NoticeCleared { .. })));
}

#[tokio::test]
async fn test_bundled_illustrations_are_kept() {
    let harness = Harness::new();
    let mut input = story("bundled", 2, true);
    for page in &mut input.pages {
        page.bundled_asset = Some(format!("assets/page{}.png", page.page_number));
    }

    let ids = harness.engine.submit_story(input, None).unwrap();
    assert!(ids.is_empty());
    harness.engine.run_story(&StoryId::new("bundled")).await.unwrap();
    assert_eq!(harness.provider.call_count(), 0);
    for page in harness.pages("bundled") {
        assert!(page.has_bundled_illustration());
    }
}

#[tokio::test]
async fn test_closed_engine_refuses_story_runs() {
    let harness = Harness::new();
    harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    harness.engine.close();

    let err = harness.engine.run_story(&StoryId::new("s1")).await.unwrap_err();
    assert!(matches!(err, PipelineError::EngineClosed(ref id) if id.as_str() == "s1"));
    assert!(!err.is_transient());
    assert_eq!(harness.provider.call_count(), 0);
}
