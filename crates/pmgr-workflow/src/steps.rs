use serde::{Deserialize, Serialize};

use crate::model::SelectedApp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    DownloadApk,
    LoadPatches,
    PrepareSplitApk,
    ReadApk,
    ExecutePatches,
    WritePatchedApk,
    SignPatchedApk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Preparing,
    Patching,
    Saving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Waiting,
    Running,
    Failed,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKey {
    Download,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub category: StepCategory,
    pub state: StepState,
    pub progress_key: Option<ProgressKey>,
    /// Share of overall progress. The patch execution step carries 0 here;
    /// its share is [`StepList::execute_weight`].
    pub weight: f64,
    pub message: Option<String>,
}

impl Step {
    fn new(id: StepId, name: &str, category: StepCategory, weight: f64) -> Self {
        Self {
            id,
            name: name.to_string(),
            category,
            state: StepState::Waiting,
            progress_key: None,
            weight,
            message: None,
        }
    }

    fn split(state: StepState) -> Self {
        let mut step = Step::new(
            StepId::PrepareSplitApk,
            "Prepare split APK",
            StepCategory::Preparing,
            0.1,
        );
        step.state = state;
        step
    }
}

/// Ordered workflow steps with a current-step cursor.
///
/// Steps advance strictly in order; only the split preparation step can be
/// inserted or removed after construction, and both keep the cursor on the
/// same logical step.
#[derive(Debug, Clone)]
pub struct StepList {
    steps: Vec<Step>,
    current: usize,
    version: u64,
    requires_split: bool,
    execute_weight: f64,
}

impl StepList {
    pub fn build(selected_app: &SelectedApp, requires_split: bool) -> Self {
        let needs_download = selected_app.needs_download();
        let mut steps = Vec::with_capacity(7);

        if needs_download {
            let mut download = Step::new(
                StepId::DownloadApk,
                "Download APK",
                StepCategory::Preparing,
                0.1,
            );
            download.state = StepState::Running;
            download.progress_key = Some(ProgressKey::Download);
            steps.push(download);
        }

        let mut load = Step::new(
            StepId::LoadPatches,
            "Load patches",
            StepCategory::Preparing,
            0.05,
        );
        if !needs_download {
            load.state = StepState::Running;
        }
        steps.push(load);

        if requires_split {
            steps.push(Step::split(StepState::Waiting));
        }
        steps.push(Step::new(
            StepId::ReadApk,
            "Read APK",
            StepCategory::Preparing,
            0.05,
        ));
        steps.push(Step::new(
            StepId::ExecutePatches,
            "Apply patches",
            StepCategory::Patching,
            0.0,
        ));
        steps.push(Step::new(
            StepId::WritePatchedApk,
            "Write patched APK",
            StepCategory::Saving,
            0.4,
        ));
        steps.push(Step::new(
            StepId::SignPatchedApk,
            "Sign patched APK",
            StepCategory::Saving,
            0.1,
        ));

        let declared: f64 = steps.iter().map(|step| step.weight).sum();
        Self {
            steps,
            current: 0,
            version: 0,
            requires_split,
            execute_weight: (1.0 - declared).max(0.0),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> Option<&Step> {
        self.steps.get(self.current)
    }

    /// Bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn requires_split(&self) -> bool {
        self.requires_split
    }

    pub fn execute_weight(&self) -> f64 {
        self.execute_weight
    }

    /// Overall progress in `[0, 1]`.
    pub fn progress(&self, completed_patches: usize, total_patches: usize) -> f64 {
        let finished: f64 = self
            .steps
            .iter()
            .filter(|step| {
                step.state == StepState::Completed && step.category != StepCategory::Patching
            })
            .map(|step| step.weight)
            .sum();
        let patching = if total_patches == 0 {
            0.0
        } else {
            completed_patches as f64 / total_patches as f64 * self.execute_weight
        };
        (finished + patching).clamp(0.0, 1.0)
    }

    /// Updates the current step and, when it completes, starts the next one.
    pub fn apply_progress(
        &mut self,
        name: Option<String>,
        state: Option<StepState>,
        message: Option<String>,
    ) {
        let last = self.steps.len().saturating_sub(1);
        let Some(step) = self.steps.get_mut(self.current) else {
            return;
        };
        if let Some(name) = name {
            step.name = name;
        }
        if let Some(state) = state {
            step.state = state;
        }
        if let Some(message) = message {
            step.message = Some(message);
        }
        if state == Some(StepState::Completed) && self.current != last {
            self.current += 1;
            self.steps[self.current].state = StepState::Running;
        }
        self.version += 1;
    }

    pub fn mark_failed(&mut self, message: Option<String>) {
        self.apply_progress(None, Some(StepState::Failed), message);
    }

    /// Adds or removes the split preparation step after new information
    /// about the input. A merged input completes the split step.
    pub fn update_split_requirement(&mut self, needs_split: bool, merged: bool) {
        if needs_split && !self.requires_split {
            self.requires_split = true;
            self.insert_split_step();
        } else if !needs_split && self.requires_split {
            self.requires_split = false;
            self.remove_split_step();
            return;
        }

        if needs_split && merged {
            if let Some(index) = self.index_of(StepId::PrepareSplitApk) {
                self.steps[index].state = StepState::Completed;
                if self.current == index && index + 1 < self.steps.len() {
                    self.current += 1;
                    self.steps[self.current].state = StepState::Running;
                }
                self.version += 1;
            }
        }
    }

    /// Inserts the split step after "load patches", else before "read APK",
    /// else at the end. A step inserted behind the cursor counts as done.
    pub fn insert_split_step(&mut self) {
        if self.index_of(StepId::PrepareSplitApk).is_some() {
            return;
        }
        let index = match self.index_of(StepId::LoadPatches) {
            Some(load) => load + 1,
            None => self.index_of(StepId::ReadApk).unwrap_or(self.steps.len()),
        };
        let behind_cursor = index <= self.current;
        let state = if behind_cursor {
            StepState::Completed
        } else {
            StepState::Waiting
        };
        self.steps.insert(index, Step::split(state));
        if behind_cursor {
            self.current += 1;
        }
        self.version += 1;
    }

    pub fn remove_split_step(&mut self) {
        let Some(index) = self.index_of(StepId::PrepareSplitApk) else {
            return;
        };
        let removing_current = index == self.current;
        self.steps.remove(index);

        if self.current > index {
            self.current -= 1;
        } else if removing_current {
            self.current = index.min(self.steps.len().saturating_sub(1));
            if let Some(step) = self.steps.get_mut(self.current) {
                if step.state == StepState::Waiting {
                    step.state = StepState::Running;
                }
            }
        }
        self.version += 1;
    }

    fn index_of(&self, id: StepId) -> Option<usize> {
        self.steps.iter().position(|step| step.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download_app() -> SelectedApp {
        SelectedApp::Download {
            package_name: "com.example".into(),
            version: Some("1.0".into()),
            url: "https://example.invalid/app.apk".into(),
        }
    }

    fn local_app() -> SelectedApp {
        SelectedApp::Local {
            package_name: "com.example".into(),
            version: None,
            file: "/tmp/in.apk".into(),
            temporary: false,
            resolved: true,
        }
    }

    fn complete_current(list: &mut StepList) {
        list.apply_progress(None, Some(StepState::Completed), None);
    }

    fn ids(list: &StepList) -> Vec<StepId> {
        list.steps().iter().map(|s| s.id).collect()
    }

    #[test]
    fn patch_step_takes_remaining_weight() {
        let list = StepList::build(&download_app(), false);
        assert!((list.execute_weight() - 0.3).abs() < 1e-9);

        let split = StepList::build(&local_app(), true);
        assert!((split.execute_weight() - 0.3).abs() < 1e-9);
        assert_eq!(split.steps()[0].state, StepState::Running);
        assert_eq!(split.steps()[0].id, StepId::LoadPatches);
    }

    #[test]
    fn progress_counts_finished_steps_and_patch_ratio() {
        let mut list = StepList::build(&download_app(), false);
        for _ in 0..3 {
            complete_current(&mut list);
        }
        assert_eq!(list.current().unwrap().id, StepId::ExecutePatches);
        assert!((list.progress(5, 10) - 0.35).abs() < 1e-9);
        assert_eq!(list.progress(0, 0), list.progress(0, 1));
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let mut list = StepList::build(&download_app(), true);
        let total = 4;
        let mut last = 0.0;
        let mut done = 0;
        for _ in 0..list.steps().len() {
            if list.current().unwrap().id == StepId::ExecutePatches {
                while done < total {
                    done += 1;
                    let p = list.progress(done, total);
                    assert!(p >= last && p <= 1.0);
                    last = p;
                }
            }
            complete_current(&mut list);
            let p = list.progress(done, total);
            assert!(p >= last && p <= 1.0);
            last = p;
        }
        assert!(list.progress(10, 1) <= 1.0);
    }

    #[test]
    fn completing_starts_next_step_but_not_past_end() {
        let mut list = StepList::build(&local_app(), false);
        complete_current(&mut list);
        assert_eq!(list.current_index(), 1);
        assert_eq!(list.steps()[1].state, StepState::Running);
        for _ in 0..10 {
            complete_current(&mut list);
        }
        assert_eq!(list.current_index(), list.steps().len() - 1);
    }

    #[test]
    fn insert_then_remove_split_restores_list() {
        for advance in 0..5 {
            let mut list = StepList::build(&download_app(), false);
            for _ in 0..advance {
                complete_current(&mut list);
            }
            let before_ids = ids(&list);
            let before_current = list.current().unwrap().id;
            let before_index = list.current_index();

            list.insert_split_step();
            assert_eq!(list.current().unwrap().id, before_current);
            let split_at = list
                .steps()
                .iter()
                .position(|s| s.id == StepId::PrepareSplitApk)
                .unwrap();
            assert_eq!(list.steps()[split_at - 1].id, StepId::LoadPatches);

            list.remove_split_step();
            assert_eq!(ids(&list), before_ids);
            assert_eq!(list.current_index(), before_index);
        }
    }

    #[test]
    fn removing_running_split_step_promotes_next() {
        let mut list = StepList::build(&local_app(), true);
        complete_current(&mut list);
        assert_eq!(list.current().unwrap().id, StepId::PrepareSplitApk);

        list.update_split_requirement(false, false);
        assert_eq!(list.current().unwrap().id, StepId::ReadApk);
        assert_eq!(list.current().unwrap().state, StepState::Running);
        assert!(!list.requires_split());
    }

    #[test]
    fn merged_input_completes_split_step() {
        let mut list = StepList::build(&local_app(), false);
        complete_current(&mut list);
        let v = list.version();
        list.update_split_requirement(true, true);
        let split = list
            .steps()
            .iter()
            .find(|s| s.id == StepId::PrepareSplitApk)
            .unwrap();
        assert_eq!(split.state, StepState::Completed);
        assert_eq!(list.current().unwrap().id, StepId::ReadApk);
        assert!(list.version() > v);
    }

    #[test]
    fn progress_message_updates_current_step() {
        let mut list = StepList::build(&local_app(), false);
        list.apply_progress(Some("Loading 12 patches".into()), None, Some("bundle 1".into()));
        let step = list.current().unwrap();
        assert_eq!(step.name, "Loading 12 patches");
        assert_eq!(step.message.as_deref(), Some("bundle 1"));
        assert_eq!(step.state, StepState::Running);

        list.mark_failed(Some("boom".into()));
        assert_eq!(list.current().unwrap().state, StepState::Failed);
    }
}
