//! Ordering properties of the task queue under random story shapes.

use picturebook::scheduler::{StoryPlanOptions, TaskQueue};
use picturebook::story::Page;
use picturebook::task::{TaskStatus, TaskType};
use picturebook::types::{StoryId, TaskId};
use picturebook::visual::PageVisualPlan;
use proptest::prelude::*;

fn pages(story_id: &StoryId, count: u32) -> Vec<Page> {
    (1..=count)
        .map(|n| Page::new(story_id, n, format!("page {}", n), PageVisualPlan::default()))
        .collect()
}

/// Run the queue to exhaustion, completing every task it hands out.
fn drain(queue: &mut TaskQueue) -> Vec<TaskId> {
    let mut order = Vec::new();
    while let Some(id) = queue.next_eligible_task().map(|t| t.id.clone()) {
        let task = queue.get_mut(&id).unwrap();
        task.transition(TaskStatus::Generating).unwrap();
        task.transition(TaskStatus::Ready).unwrap();
        queue.commit(&id);
        order.push(id);
    }
    order
}

proptest! {
    #[test]
    fn global_reference_runs_before_every_page(count in 1u32..12, chain in any::<bool>()) {
        let story_id = StoryId::new("story");
        let mut queue = TaskQueue::new(3);
        let planned = queue.plan_story(
            &story_id,
            &pages(&story_id, count),
            StoryPlanOptions { global_reference: true, chain_previous_page: chain },
        );
        prop_assert_eq!(planned.len() as u32, count + 1);
        prop_assert_eq!(
            queue.get(&planned[0]).map(|t| t.task_type),
            Some(TaskType::GlobalReference)
        );

        let order = drain(&mut queue);
        prop_assert_eq!(order.len(), planned.len());
        prop_assert_eq!(&order[0], &planned[0]);
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn chained_pages_run_in_page_order(count in 1u32..12) {
        let story_id = StoryId::new("story");
        let mut queue = TaskQueue::new(3);
        let planned = queue.plan_story(
            &story_id,
            &pages(&story_id, count),
            StoryPlanOptions { global_reference: false, chain_previous_page: true },
        );
        prop_assert_eq!(drain(&mut queue), planned);
    }

    #[test]
    fn planning_twice_adds_nothing(count in 1u32..12, global in any::<bool>()) {
        let story_id = StoryId::new("story");
        let story_pages = pages(&story_id, count);
        let options = StoryPlanOptions { global_reference: global, chain_previous_page: true };
        let mut queue = TaskQueue::new(3);
        let first = queue.plan_story(&story_id, &story_pages, options);
        let len = queue.len();
        let second = queue.plan_story(&story_id, &story_pages, options);
        prop_assert_eq!(first, second);
        prop_assert_eq!(queue.len(), len);
    }
}
