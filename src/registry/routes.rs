//! Per-table dispatch routes.
//!
//! The routing table is data, not code: each watched table gets a
//! `TableRoute` strategy registered at construction, and
//! `handle_database_change` looks the table up and hands the event over.
//! Routes only schedule invalidations and emit notifications; they never
//! fail dispatch: every lookup error is logged and swallowed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::backend::{scalar_field, ChangeEvent, ChangeKind, RealtimeBackend};
use crate::invalidation::{InvalidationDebouncer, InvalidationKey};
use crate::notify::{Notification, NotificationEmitter, NotificationKind};

pub const TABLE_PROJECTS: &str = "projects";
pub const TABLE_PHASES: &str = "project_phases";
pub const TABLE_STEPS: &str = "project_steps";
pub const TABLE_TASKS: &str = "project_tasks";
pub const TABLE_COMMENTS: &str = "comments";

/// Everything a route needs to act on an event.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub backend: Arc<dyn RealtimeBackend>,
    pub debouncer: Arc<InvalidationDebouncer>,
    pub emitter: Arc<NotificationEmitter>,
}

#[async_trait]
pub(crate) trait TableRoute: Send + Sync {
    async fn handle(&self, cx: &DispatchContext, event: &ChangeEvent);
}

/// Fixed routing table for the project hierarchy.
pub(crate) fn default_routes() -> HashMap<&'static str, Arc<dyn TableRoute>> {
    let mut routes: HashMap<&'static str, Arc<dyn TableRoute>> = HashMap::new();
    routes.insert(TABLE_PROJECTS, Arc::new(ProjectsRoute));
    routes.insert(TABLE_PHASES, Arc::new(PhasesRoute));
    routes.insert(TABLE_STEPS, Arc::new(StepsRoute));
    routes.insert(TABLE_TASKS, Arc::new(TasksRoute));
    routes.insert(TABLE_COMMENTS, Arc::new(CommentsRoute));
    routes
}

/// Invalidate the two composite keys every project mutation touches.
fn schedule_project_keys(cx: &DispatchContext, project_id: &str) {
    cx.debouncer
        .schedule(InvalidationKey::new(["project", project_id]));
    cx.debouncer
        .schedule(InvalidationKey::new(["project-hierarchy", project_id]));
}

/// phase id → owning project id, via one point read. Failure is logged and
/// swallowed; it must never abort the rest of dispatch.
async fn project_for_phase(cx: &DispatchContext, phase_id: &str) -> Option<String> {
    match cx
        .backend
        .select_one(TABLE_PHASES, "project_id", "id", phase_id)
        .await
    {
        Ok(row) => scalar_field(&row, "project_id"),
        Err(e) => {
            tracing::warn!("phase {phase_id}: owning project lookup failed: {e}");
            None
        }
    }
}

/// step id → owning project id, resolved through the step's phase.
async fn project_for_step(cx: &DispatchContext, step_id: &str) -> Option<String> {
    let phase_id = match cx
        .backend
        .select_one(TABLE_STEPS, "phase_id", "id", step_id)
        .await
    {
        Ok(row) => scalar_field(&row, "phase_id"),
        Err(e) => {
            tracing::warn!("step {step_id}: owning phase lookup failed: {e}");
            None
        }
    }?;
    project_for_phase(cx, &phase_id).await
}

struct ProjectsRoute;

#[async_trait]
impl TableRoute for ProjectsRoute {
    async fn handle(&self, cx: &DispatchContext, event: &ChangeEvent) {
        cx.debouncer.schedule(InvalidationKey::new(["projects"]));
        if let Some(id) = event.field("id") {
            schedule_project_keys(cx, &id);
        }
    }
}

struct PhasesRoute;

#[async_trait]
impl TableRoute for PhasesRoute {
    async fn handle(&self, cx: &DispatchContext, event: &ChangeEvent) {
        if let Some(project_id) = event.field("project_id") {
            cx.debouncer
                .schedule(InvalidationKey::new(["phases", project_id.as_str()]));
            schedule_project_keys(cx, &project_id);
        }

        // A phase status transition is user-visible progress.
        if event.kind == ChangeKind::Update {
            let old_status = event.old_field("status");
            let new_status = event.new_field("status");
            if let (Some(phase_id), Some(status)) = (event.field("id"), new_status.clone()) {
                if new_status != old_status {
                    cx.emitter.send(
                        Notification::new(NotificationKind::PhaseProgression, "phase", phase_id)
                            .with_payload(json!({
                                "status": status,
                                "previous_status": old_status,
                                "project_id": event.field("project_id"),
                            })),
                    );
                }
            }
        }
    }
}

struct StepsRoute;

#[async_trait]
impl TableRoute for StepsRoute {
    async fn handle(&self, cx: &DispatchContext, event: &ChangeEvent) {
        let Some(phase_id) = event.field("phase_id") else {
            return;
        };
        cx.debouncer
            .schedule(InvalidationKey::new(["steps", phase_id.as_str()]));

        if let Some(project_id) = project_for_phase(cx, &phase_id).await {
            schedule_project_keys(cx, &project_id);
        }
    }
}

struct TasksRoute;

#[async_trait]
impl TableRoute for TasksRoute {
    async fn handle(&self, cx: &DispatchContext, event: &ChangeEvent) {
        if let Some(step_id) = event.field("step_id") {
            cx.debouncer
                .schedule(InvalidationKey::new(["tasks", step_id.as_str()]));

            if let Some(project_id) = project_for_step(cx, &step_id).await {
                schedule_project_keys(cx, &project_id);
            }
        }

        if event.kind != ChangeKind::Update {
            return;
        }
        let Some(task_id) = event.field("id") else {
            return;
        };

        // Exactly once per actual reassignment, not on unrelated updates.
        // Un-assignment counts: a null assignee is still a change.
        let previous = event.old_field("assigned_to");
        let current = event.new_field("assigned_to");
        if current != previous {
            cx.emitter.send(
                Notification::new(NotificationKind::TaskAssignment, "task", task_id.clone())
                    .with_payload(json!({
                        "assignee": current,
                        "previous_assignee": previous,
                        "step_id": event.field("step_id"),
                    })),
            );
        }

        let old_deps = event.old_field("depends_on");
        let new_deps = event.new_field("depends_on");
        if new_deps != old_deps {
            cx.emitter.send(
                Notification::new(NotificationKind::DependencyChanged, "task", task_id)
                    .with_payload(json!({
                        "depends_on": new_deps,
                        "previously_depended_on": old_deps,
                    })),
            );
        }
    }
}

struct CommentsRoute;

#[async_trait]
impl TableRoute for CommentsRoute {
    async fn handle(&self, cx: &DispatchContext, event: &ChangeEvent) {
        let (Some(entity_type), Some(entity_id)) =
            (event.field("entity_type"), event.field("entity_id"))
        else {
            tracing::debug!("comment event without entity reference, skipping");
            return;
        };

        cx.debouncer.schedule(InvalidationKey::new([
            "comments",
            entity_type.as_str(),
            entity_id.as_str(),
        ]));

        cx.emitter.send(
            Notification::new(NotificationKind::CommentAdded, entity_type, entity_id)
                .with_actor(event.field("author_id"))
                .with_payload(json!({"comment_id": event.field("id")})),
        );
    }
}
