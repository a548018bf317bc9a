//! Linking, ordering and staleness analysis of the action graph.
//!
//! Actions are linked through a producer map: an edge exists from A to B
//! when A consumes a file B produces. The graph owns the action storage and
//! all derived relations; actions themselves stay plain data, addressed by
//! [`ActionId`].

use crate::{
    action::{Action, ActionKind},
    config::BuildConfig,
    deplist::DependencyListCache,
    error::{BuildError, Result},
    history::HistoryRouter,
    items::{FileItem, ItemRegistry},
};
use dashmap::DashMap;
use rayon::prelude::*;
use std::{
    collections::HashMap,
    fmt::Write as _,
    fs,
    ops::Index,
    path::Path,
    time::{Duration, SystemTime},
};
use yansi::Paint;

/// Index of an action within its [`ActionGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub usize);

/// A linked, cycle-checked action graph.
#[derive(Debug)]
pub struct ActionGraph {
    actions: Vec<Action>,
    producers: HashMap<FileItem, ActionId>,
    prerequisite_actions: Vec<Vec<ActionId>>,
    dependent_actions: Vec<Vec<ActionId>>,
    total_dependent_actions: Vec<usize>,
}

impl Index<ActionId> for ActionGraph {
    type Output = Action;

    fn index(&self, id: ActionId) -> &Action {
        &self.actions[id.0]
    }
}

impl ActionGraph {
    /// Links `actions` into a graph: builds the producer map, derives
    /// prerequisite edges, rejects producer conflicts and cycles, and
    /// computes the transitive dependent counts used as scheduling priority.
    ///
    /// Two actions producing the same item merge silently when every field
    /// matches; any difference is a fatal conflict.
    pub fn link(actions: Vec<Action>) -> Result<Self> {
        // drop exact duplicates before conflict checking
        let mut unique: Vec<Action> = Vec::with_capacity(actions.len());
        for action in actions {
            if !unique.contains(&action) {
                unique.push(action);
            }
        }
        let actions = unique;

        let mut producers: HashMap<FileItem, ActionId> = HashMap::new();
        for (index, action) in actions.iter().enumerate() {
            for item in &action.produced_items {
                if let Some(existing) = producers.insert(item.clone(), ActionId(index)) {
                    let other = &actions[existing.0];
                    let diff = other.describe_differences(action).join("\n");
                    error!("conflicting producers for \"{item}\"");
                    return Err(BuildError::ConflictingProducers {
                        item: item.path().to_path_buf(),
                        diff,
                    });
                }
            }
        }

        let mut prerequisite_actions: Vec<Vec<ActionId>> = Vec::with_capacity(actions.len());
        for (index, action) in actions.iter().enumerate() {
            let mut prereqs: Vec<ActionId> = Vec::new();
            for item in &action.prerequisite_items {
                if let Some(producer) = producers.get(item) {
                    if producer.0 != index && !prereqs.contains(producer) {
                        prereqs.push(*producer);
                    }
                }
            }
            prerequisite_actions.push(prereqs);
        }

        let mut dependent_actions: Vec<Vec<ActionId>> = vec![Vec::new(); actions.len()];
        for (index, prereqs) in prerequisite_actions.iter().enumerate() {
            for prereq in prereqs {
                dependent_actions[prereq.0].push(ActionId(index));
            }
        }

        let mut graph = Self {
            total_dependent_actions: vec![0; actions.len()],
            actions,
            producers,
            prerequisite_actions,
            dependent_actions,
        };
        graph.detect_cycles()?;

        let totals =
            (0..graph.actions.len()).map(|index| graph.count_dependents(index)).collect();
        graph.total_dependent_actions = totals;

        trace!("linked action graph with {} actions", graph.actions.len());
        Ok(graph)
    }

    /// Repeatedly prunes actions whose prerequisites are all pruned; any
    /// remainder participates in a cycle.
    fn detect_cycles(&self) -> Result<()> {
        let mut resolved = vec![false; self.actions.len()];
        loop {
            let mut changed = false;
            for index in 0..self.actions.len() {
                if !resolved[index]
                    && self.prerequisite_actions[index].iter().all(|p| resolved[p.0])
                {
                    resolved[index] = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        if resolved.iter().all(|r| *r) {
            return Ok(());
        }

        let cyclic: Vec<usize> =
            (0..self.actions.len()).filter(|index| !resolved[*index]).collect();
        let mut report = String::new();
        for (position, index) in cyclic.iter().enumerate() {
            let action = &self.actions[*index];
            let _ = writeln!(
                report,
                "  [{position}] {action}\n      command: {}",
                action.command_line()
            );
            for item in &action.prerequisite_items {
                let _ = writeln!(report, "      requires: {item}");
            }
            for prereq in &self.prerequisite_actions[*index] {
                if let Some(edge_position) = cyclic.iter().position(|c| *c == prereq.0) {
                    let linking: Vec<String> = self.actions[prereq.0]
                        .produced_items
                        .iter()
                        .filter(|item| action.prerequisite_items.contains(item))
                        .map(|item| item.to_string())
                        .collect();
                    let _ = writeln!(
                        report,
                        "      cyclic edge to [{edge_position}] through {}",
                        linking.join(", ")
                    );
                }
            }
        }
        error!("{}", Paint::red("cycle detected in action graph"));
        Err(BuildError::CyclicActions { report })
    }

    fn count_dependents(&self, index: usize) -> usize {
        let mut visited = vec![false; self.actions.len()];
        let mut stack: Vec<usize> = self.dependent_actions[index].iter().map(|d| d.0).collect();
        let mut count = 0;
        while let Some(current) = stack.pop() {
            if visited[current] {
                continue;
            }
            visited[current] = true;
            count += 1;
            stack.extend(self.dependent_actions[current].iter().map(|d| d.0));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ActionId> {
        (0..self.actions.len()).map(ActionId)
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// The actions producing this action's prerequisite items.
    pub fn prerequisites(&self, id: ActionId) -> &[ActionId] {
        &self.prerequisite_actions[id.0]
    }

    /// The actions directly consuming this action's produced items.
    pub fn dependents(&self, id: ActionId) -> &[ActionId] {
        &self.dependent_actions[id.0]
    }

    /// Transitive count of actions depending on `id`; the primary
    /// scheduling-priority key.
    pub fn total_dependent_actions(&self, id: ActionId) -> usize {
        self.total_dependent_actions[id.0]
    }

    pub fn producer_of(&self, item: &FileItem) -> Option<ActionId> {
        self.producers.get(item).copied()
    }

    /// Stable execution-priority order: transitive dependents descending,
    /// then prerequisite count descending. Front-loads high-fan-out work so
    /// leaf-heavy critical paths start earliest.
    pub fn sorted_for_execution(&self, ids: &[ActionId]) -> Vec<ActionId> {
        let mut sorted = ids.to_vec();
        sorted.sort_by(|a, b| {
            self.total_dependent_actions[b.0]
                .cmp(&self.total_dependent_actions[a.0])
                .then_with(|| {
                    self.actions[b.0]
                        .prerequisite_items
                        .len()
                        .cmp(&self.actions[a.0].prerequisite_items.len())
                })
        });
        sorted
    }

    /// The actions needed to produce `targets`: the producers of the target
    /// paths plus the closure over prerequisite actions. Empty `targets`
    /// selects the whole graph.
    pub fn prerequisite_closure(
        &self,
        targets: &[std::path::PathBuf],
        registry: &ItemRegistry,
    ) -> Vec<ActionId> {
        if targets.is_empty() {
            return self.ids().collect();
        }
        let mut included = vec![false; self.actions.len()];
        let mut stack: Vec<usize> = targets
            .iter()
            .filter_map(|target| self.producer_of(&registry.file(target)).map(|id| id.0))
            .collect();
        while let Some(index) = stack.pop() {
            if included[index] {
                continue;
            }
            included[index] = true;
            stack.extend(self.prerequisite_actions[index].iter().map(|p| p.0));
        }
        (0..self.actions.len()).filter(|i| included[*i]).map(ActionId).collect()
    }

    /// Ensures the parent directory of every produced item exists.
    pub fn prepare_output_directories(&self, ids: &[ActionId]) -> Result<()> {
        for id in ids {
            for item in &self[*id].produced_items {
                if let Some(parent) = item.path().parent() {
                    fs::create_dir_all(parent).map_err(|err| BuildError::io(err, parent))?;
                }
            }
        }
        Ok(())
    }

    /// Removes every file scheduled for deletion by the given actions.
    pub fn delete_scheduled_items(&self, ids: &[ActionId]) -> Result<()> {
        for id in ids {
            for item in &self[*id].delete_items {
                if item.exists() {
                    debug!("deleting \"{item}\" before executing {}", self[*id]);
                    fs::remove_file(item.path())
                        .map_err(|err| BuildError::io(err, item.path()))?;
                    item.invalidate();
                }
            }
        }
        Ok(())
    }

    /// Fails when any produced item's absolute path exceeds the platform
    /// limit; warns when an item sits deeper below the workspace root than
    /// the configured budget.
    pub fn validate_output_path_lengths(
        &self,
        ids: &[ActionId],
        workspace_root: &Path,
        warning_budget: usize,
    ) -> Result<()> {
        for id in ids {
            for item in &self[*id].produced_items {
                let length = item.path().as_os_str().len();
                if length > BuildConfig::MAX_OUTPUT_PATH_LENGTH {
                    return Err(BuildError::OutputPathTooLong {
                        path: item.path().to_path_buf(),
                        max: BuildConfig::MAX_OUTPUT_PATH_LENGTH,
                    });
                }
                if let Ok(relative) = item.path().strip_prefix(workspace_root) {
                    let relative_length = relative.as_os_str().len();
                    if relative_length > warning_budget {
                        warn!(
                            "output path \"{item}\" is {relative_length} characters below the workspace root; budget is {warning_budget}"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Inputs the staleness pass needs besides the graph itself.
pub struct StalenessContext<'a> {
    pub history: &'a HistoryRouter,
    pub dependency_lists: &'a DependencyListCache,
    pub registry: &'a ItemRegistry,
    /// Tolerance for prerequisite timestamps on network filesystems. The
    /// same slop applies to dependency-manifest entries.
    pub mtime_slop: Duration,
    pub ignore_import_library_changes: bool,
}

/// Decides which actions must run, memoising per action.
pub struct StalenessAnalyzer<'a> {
    graph: &'a ActionGraph,
    ctx: StalenessContext<'a>,
    memo: DashMap<ActionId, bool>,
}

impl<'a> StalenessAnalyzer<'a> {
    pub fn new(graph: &'a ActionGraph, ctx: StalenessContext<'a>) -> Self {
        Self { graph, ctx, memo: DashMap::new() }
    }

    /// Computes the stale subset of `ids`, in the input order.
    ///
    /// Dependency manifests are pre-parsed concurrently before the main
    /// pass, and the pass itself parallelises over actions; results for
    /// distinct actions are independent.
    pub fn gather(&self, ids: &[ActionId]) -> Result<Vec<ActionId>> {
        ids.par_iter()
            .filter(|id| self.graph[**id].dependency_list_file.is_some())
            .try_for_each(|id| -> Result<()> {
                let manifest = self.graph[*id].dependency_list_file.as_ref().unwrap();
                self.ctx.dependency_lists.dependencies(manifest, self.ctx.registry)?;
                Ok(())
            })?;

        let flags = ids
            .par_iter()
            .map(|id| self.is_stale(*id))
            .collect::<Result<Vec<bool>>>()?;
        Ok(ids
            .iter()
            .zip(flags)
            .filter_map(|(id, stale)| stale.then_some(*id))
            .collect())
    }

    /// Whether `id` must run. Memoised; safe to call from multiple threads.
    pub fn is_stale(&self, id: ActionId) -> Result<bool> {
        if let Some(known) = self.memo.get(&id) {
            return Ok(*known);
        }
        let stale = self.compute(id)?;
        self.memo.insert(id, stale);
        Ok(stale)
    }

    fn compute(&self, id: ActionId) -> Result<bool> {
        let action = &self.graph[id];

        // Update the command-line fingerprint for every produced item first,
        // so a single pass refreshes the whole history regardless of which
        // check trips below.
        let command_line = action.command_line();
        let mut stale = false;
        for item in &action.produced_items {
            if self.ctx.history.update_producing_command_line(item, &command_line) {
                trace!("{action}: command line changed for \"{item}\"");
                stale = true;
            }
        }

        // The oldest existing output is the effective last execution time; a
        // partially built output set counts as not yet run.
        let mut last_execution: Option<SystemTime> = None;
        for item in &action.produced_items {
            if !produced_item_is_valid(action, item) {
                trace!("{action}: missing produced item \"{item}\"");
                stale = true;
            } else if let Some(modified) = item.last_write_time() {
                last_execution =
                    Some(last_execution.map_or(modified, |current| current.min(modified)));
            }
        }

        for prereq in self.graph.prerequisites(id) {
            if self.is_stale(*prereq)? && !self.ignores_prerequisite_action(id, *prereq) {
                trace!("{action}: prerequisite {} is stale", self.graph[*prereq]);
                stale = true;
            }
        }

        if let Some(last_execution) = last_execution {
            let threshold = last_execution + self.ctx.mtime_slop;
            for item in &action.prerequisite_items {
                if self.ignores_prerequisite_item(item) {
                    continue;
                }
                if let Some(modified) = item.last_write_time() {
                    if modified > threshold {
                        trace!("{action}: prerequisite \"{item}\" is newer than the last run");
                        stale = true;
                    }
                }
            }

            if let Some(manifest) = &action.dependency_list_file {
                match self.ctx.dependency_lists.dependencies(manifest, self.ctx.registry)? {
                    None => {
                        trace!("{action}: dependency manifest \"{manifest}\" is missing");
                        stale = true;
                    }
                    Some(files) => {
                        for file in files.iter() {
                            match file.last_write_time() {
                                None => {
                                    trace!("{action}: listed dependency \"{file}\" is missing");
                                    stale = true;
                                }
                                Some(modified) if modified > threshold => {
                                    trace!("{action}: listed dependency \"{file}\" changed");
                                    stale = true;
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }
            }
        }

        Ok(stale)
    }

    /// A stale prerequisite action does not propagate when it produces an
    /// import library and this action consumes nothing else from it.
    fn ignores_prerequisite_action(&self, root: ActionId, prereq: ActionId) -> bool {
        if !self.ctx.ignore_import_library_changes {
            return false;
        }
        let prereq_action = &self.graph[prereq];
        prereq_action.produces_import_library
            && prereq_action.produced_items.iter().all(|item| {
                item.has_extension("lib") || !self.graph[root].prerequisite_items.contains(item)
            })
    }

    /// Timestamp changes of an import library alone never invalidate a
    /// dependent; only the paired shared library matters.
    fn ignores_prerequisite_item(&self, item: &FileItem) -> bool {
        self.ctx.ignore_import_library_changes
            && item.has_extension("lib")
            && self
                .graph
                .producer_of(item)
                .is_some_and(|producer| self.graph[producer].produces_import_library)
    }
}

/// A produced item counts as present when it exists with content. The one
/// exception is a zero-length object file from a compile: an empty
/// translation unit legitimately produces one.
fn produced_item_is_valid(action: &Action, item: &FileItem) -> bool {
    let status = item.status();
    if !status.exists {
        return false;
    }
    if status.length == 0 {
        return action.kind == ActionKind::Compile
            && (item.has_extension("obj") || item.has_extension("o"));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionKind};
    use pretty_assertions::assert_eq;
    use std::{
        fs,
        path::{Path, PathBuf},
        time::{Duration, SystemTime},
    };

    fn compile(registry: &ItemRegistry, dir: &Path, source: &str, object: &str) -> Action {
        let mut action = Action::new(ActionKind::Compile);
        action.command_path = PathBuf::from("/usr/bin/cc");
        action.command_arguments = format!("-c {source} -o {object}");
        action.command_description = "Compile".to_string();
        action.status_description = source.to_string();
        action.prerequisite_items = vec![registry.file(dir.join(source))];
        action.produced_items = vec![registry.file(dir.join(object))];
        action
    }

    fn link(registry: &ItemRegistry, dir: &Path, inputs: &[&str], output: &str) -> Action {
        let mut action = Action::new(ActionKind::Link);
        action.command_path = PathBuf::from("/usr/bin/ld");
        action.command_arguments = format!("-o {output} {}", inputs.join(" "));
        action.command_description = "Link".to_string();
        action.status_description = output.to_string();
        action.prerequisite_items =
            inputs.iter().map(|input| registry.file(dir.join(input))).collect();
        action.produced_items = vec![registry.file(dir.join(output))];
        action
    }

    fn write_with_mtime(path: &Path, content: &[u8], time: SystemTime) {
        fs::write(path, content).unwrap();
        let file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }

    struct Fixture {
        registry: ItemRegistry,
        dependency_lists: DependencyListCache,
        history: HistoryRouter,
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let mut history = HistoryRouter::new();
            history.mount(root.join("history.bin"), &root);
            Self {
                registry: ItemRegistry::new(),
                dependency_lists: DependencyListCache::new(),
                history,
                _dir: dir,
                root,
            }
        }

        fn context(&self) -> StalenessContext<'_> {
            StalenessContext {
                history: &self.history,
                dependency_lists: &self.dependency_lists,
                registry: &self.registry,
                mtime_slop: Duration::from_secs(1),
                ignore_import_library_changes: false,
            }
        }

        fn context_ignoring_import_libraries(&self) -> StalenessContext<'_> {
            StalenessContext { ignore_import_library_changes: true, ..self.context() }
        }
    }

    #[test]
    fn links_producer_edges() {
        let f = Fixture::new();
        let graph = ActionGraph::link(vec![
            compile(&f.registry, &f.root, "a.cpp", "a.o"),
            compile(&f.registry, &f.root, "b.cpp", "b.o"),
            link(&f.registry, &f.root, &["a.o", "b.o"], "game"),
        ])
        .unwrap();

        assert_eq!(graph.prerequisites(ActionId(0)), &[]);
        assert_eq!(graph.prerequisites(ActionId(2)), &[ActionId(0), ActionId(1)]);
        assert_eq!(graph.total_dependent_actions(ActionId(0)), 1);
        assert_eq!(graph.total_dependent_actions(ActionId(2)), 0);
    }

    #[test]
    fn identical_duplicate_producers_merge() {
        let f = Fixture::new();
        let action = compile(&f.registry, &f.root, "a.cpp", "a.o");
        let graph = ActionGraph::link(vec![action.clone(), action]).unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn conflicting_producers_report_differing_fields() {
        let f = Fixture::new();
        let first = compile(&f.registry, &f.root, "a.cpp", "out.o");
        let mut second = first.clone();
        second.command_arguments = "-c a.cpp -O2 -o out.o".to_string();

        let err = ActionGraph::link(vec![first, second]).unwrap_err();
        match err {
            BuildError::ConflictingProducers { item, diff } => {
                assert!(item.ends_with("out.o"));
                assert!(diff.contains("command_arguments"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycles_are_reported_with_edges() {
        let f = Fixture::new();
        let mut a = compile(&f.registry, &f.root, "y.gen", "x.gen");
        a.prerequisite_items = vec![f.registry.file(f.root.join("y.gen"))];
        a.produced_items = vec![f.registry.file(f.root.join("x.gen"))];
        let mut b = compile(&f.registry, &f.root, "x.gen", "y.gen");
        b.prerequisite_items = vec![f.registry.file(f.root.join("x.gen"))];
        b.produced_items = vec![f.registry.file(f.root.join("y.gen"))];

        let err = ActionGraph::link(vec![a, b]).unwrap_err();
        match err {
            BuildError::CyclicActions { report } => {
                assert!(report.contains("[0]"));
                assert!(report.contains("[1]"));
                assert!(report.contains("cyclic edge"));
                assert!(report.contains("x.gen"));
                assert!(report.contains("y.gen"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sort_puts_high_fanout_first() {
        let f = Fixture::new();
        let graph = ActionGraph::link(vec![
            link(&f.registry, &f.root, &["a.o", "b.o"], "game"),
            compile(&f.registry, &f.root, "a.cpp", "a.o"),
            compile(&f.registry, &f.root, "b.cpp", "b.o"),
        ])
        .unwrap();

        let order = graph.sorted_for_execution(&graph.ids().collect::<Vec<_>>());
        // the two compiles lead, the link trails
        assert_eq!(order[2], ActionId(0));

        // topological property: a prerequisite never has fewer transitive
        // dependents than its dependent
        for id in graph.ids() {
            for prereq in graph.prerequisites(id) {
                assert!(
                    graph.total_dependent_actions(*prereq) >= graph.total_dependent_actions(id)
                );
            }
        }
    }

    #[test]
    fn prerequisite_closure_selects_producers_transitively() {
        let f = Fixture::new();
        let graph = ActionGraph::link(vec![
            compile(&f.registry, &f.root, "a.cpp", "a.o"),
            compile(&f.registry, &f.root, "b.cpp", "b.o"),
            link(&f.registry, &f.root, &["a.o"], "tool"),
        ])
        .unwrap();

        let closure = graph.prerequisite_closure(&[f.root.join("tool")], &f.registry);
        assert_eq!(closure, vec![ActionId(0), ActionId(2)]);
        assert_eq!(graph.prerequisite_closure(&[], &f.registry).len(), 3);
    }

    #[test]
    fn clean_build_marks_everything_stale() {
        let f = Fixture::new();
        fs::write(f.root.join("a.cpp"), b"int a;").unwrap();
        fs::write(f.root.join("b.cpp"), b"int b;").unwrap();
        let graph = ActionGraph::link(vec![
            compile(&f.registry, &f.root, "a.cpp", "a.o"),
            compile(&f.registry, &f.root, "b.cpp", "b.o"),
            link(&f.registry, &f.root, &["a.o", "b.o"], "game"),
        ])
        .unwrap();

        let analyzer = StalenessAnalyzer::new(&graph, f.context());
        let stale = analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
        assert_eq!(stale.len(), 3);
    }

    #[test]
    fn null_build_is_empty_and_command_change_propagates() {
        let f = Fixture::new();
        let old = SystemTime::now() - Duration::from_secs(100);
        let new = SystemTime::now() - Duration::from_secs(50);
        write_with_mtime(&f.root.join("a.cpp"), b"int a;", old);
        write_with_mtime(&f.root.join("b.cpp"), b"int b;", old);
        write_with_mtime(&f.root.join("a.o"), b"obj", new);
        write_with_mtime(&f.root.join("b.o"), b"obj", new);
        write_with_mtime(&f.root.join("game"), b"bin", new);

        let actions = vec![
            compile(&f.registry, &f.root, "a.cpp", "a.o"),
            compile(&f.registry, &f.root, "b.cpp", "b.o"),
            link(&f.registry, &f.root, &["a.o", "b.o"], "game"),
        ];
        let graph = ActionGraph::link(actions.clone()).unwrap();

        // first run records the command lines
        {
            let analyzer = StalenessAnalyzer::new(&graph, f.context());
            let stale = analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
            assert_eq!(stale.len(), 3, "unseen command lines are stale");
        }

        // unchanged second run is a null build
        {
            let analyzer = StalenessAnalyzer::new(&graph, f.context());
            let stale = analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
            assert_eq!(stale, Vec::<ActionId>::new());
        }

        // changing one compile's arguments dirties it and its dependent link
        let mut changed = actions;
        changed[0].command_arguments = "-c a.cpp -O2 -o a.o".to_string();
        let graph = ActionGraph::link(changed).unwrap();
        let analyzer = StalenessAnalyzer::new(&graph, f.context());
        let stale = analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
        assert_eq!(stale, vec![ActionId(0), ActionId(2)]);
    }

    #[test]
    fn newer_prerequisite_marks_stale_within_slop() {
        let f = Fixture::new();
        let base = SystemTime::now() - Duration::from_secs(100);
        write_with_mtime(&f.root.join("a.o"), b"obj", base);
        // newer than the output, but within the one-second tolerance
        write_with_mtime(&f.root.join("a.cpp"), b"int a;", base + Duration::from_millis(800));

        let actions = vec![compile(&f.registry, &f.root, "a.cpp", "a.o")];
        let graph = ActionGraph::link(actions).unwrap();
        {
            let analyzer = StalenessAnalyzer::new(&graph, f.context());
            assert_eq!(analyzer.gather(&[ActionId(0)]).unwrap().len(), 1);
        }
        {
            // fingerprints recorded; within-slop drift is clean
            let analyzer = StalenessAnalyzer::new(&graph, f.context());
            assert_eq!(analyzer.gather(&[ActionId(0)]).unwrap().len(), 0);
        }

        let source = f.registry.file(f.root.join("a.cpp"));
        write_with_mtime(source.path(), b"int a2;", base + Duration::from_secs(10));
        source.invalidate();
        let analyzer = StalenessAnalyzer::new(&graph, f.context());
        assert_eq!(analyzer.gather(&[ActionId(0)]).unwrap().len(), 1);
    }

    #[test]
    fn zero_length_outputs_only_valid_for_compiles() {
        let f = Fixture::new();
        let compile_action = compile(&f.registry, &f.root, "empty.cpp", "empty.o");
        let link_action = link(&f.registry, &f.root, &["empty.o"], "empty.bin");

        fs::write(f.root.join("empty.o"), b"").unwrap();
        fs::write(f.root.join("empty.bin"), b"").unwrap();
        assert!(produced_item_is_valid(&compile_action, &f.registry.file(f.root.join("empty.o"))));
        assert!(!produced_item_is_valid(&link_action, &f.registry.file(f.root.join("empty.bin"))));
    }

    #[test]
    fn missing_dependency_manifest_is_stale() {
        let f = Fixture::new();
        let old = SystemTime::now() - Duration::from_secs(100);
        let new = SystemTime::now() - Duration::from_secs(50);
        write_with_mtime(&f.root.join("a.cpp"), b"int a;", old);
        write_with_mtime(&f.root.join("a.o"), b"obj", new);

        let mut action = compile(&f.registry, &f.root, "a.cpp", "a.o");
        action.dependency_list_file = Some(f.registry.file(f.root.join("a.txt")));
        let graph = ActionGraph::link(vec![action]).unwrap();

        {
            let analyzer = StalenessAnalyzer::new(&graph, f.context());
            assert_eq!(analyzer.gather(&[ActionId(0)]).unwrap().len(), 1);
        }

        // manifest listing one old header: clean
        write_with_mtime(&f.root.join("a.h"), b"#pragma once", old);
        fs::write(f.root.join("a.txt"), format!("{}\n", f.root.join("a.h").display())).unwrap();
        f.registry.file(f.root.join("a.txt")).invalidate();
        {
            let analyzer = StalenessAnalyzer::new(&graph, f.context());
            assert_eq!(analyzer.gather(&[ActionId(0)]).unwrap().len(), 0);
        }

        // header newer than the output: stale again
        let header = f.registry.file(f.root.join("a.h"));
        write_with_mtime(header.path(), b"#pragma once // v2", SystemTime::now());
        header.invalidate();
        let analyzer = StalenessAnalyzer::new(&graph, f.context());
        assert_eq!(analyzer.gather(&[ActionId(0)]).unwrap().len(), 1);
    }

    fn shared_library_producer(f: &Fixture, stale_source_time: SystemTime) -> Action {
        write_with_mtime(&f.root.join("foo.cpp"), b"int foo;", stale_source_time);
        let mut producer = Action::new(ActionKind::Link);
        producer.command_path = PathBuf::from("/usr/bin/ld");
        producer.command_arguments = "-shared -o foo.dll foo.cpp".to_string();
        producer.command_description = "Link".to_string();
        producer.status_description = "foo.dll".to_string();
        producer.produces_import_library = true;
        producer.prerequisite_items = vec![f.registry.file(f.root.join("foo.cpp"))];
        producer.produced_items =
            vec![f.registry.file(f.root.join("foo.lib")), f.registry.file(f.root.join("foo.dll"))];
        producer
    }

    #[test]
    fn advanced_import_library_timestamp_does_not_dirty_consumers() {
        let f = Fixture::new();
        let old = SystemTime::now() - Duration::from_secs(100);
        let mid = SystemTime::now() - Duration::from_secs(60);
        let new = SystemTime::now() - Duration::from_secs(10);

        // the producer re-ran: the import library was rewritten, the shared
        // library came out identical and kept its timestamp
        write_with_mtime(&f.root.join("foo.lib"), b"imports", new);
        write_with_mtime(&f.root.join("foo.dll"), b"code", old);
        write_with_mtime(&f.root.join("app"), b"bin", mid);

        let producer = shared_library_producer(&f, old);
        let consumer = link(&f.registry, &f.root, &["foo.lib", "foo.dll"], "app");
        let graph = ActionGraph::link(vec![producer, consumer]).unwrap();

        // prime the history so only timestamps decide
        {
            let analyzer = StalenessAnalyzer::new(&graph, f.context());
            analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
        }

        let analyzer = StalenessAnalyzer::new(&graph, f.context_ignoring_import_libraries());
        let stale = analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
        assert!(!stale.contains(&ActionId(1)), "consumer of the dll must stay clean");

        // without the flag the newer .lib timestamp dirties the consumer
        let analyzer = StalenessAnalyzer::new(&graph, f.context());
        let stale = analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
        assert!(stale.contains(&ActionId(1)));
    }

    #[test]
    fn stale_import_library_producer_does_not_propagate_to_lib_only_consumers() {
        let f = Fixture::new();
        let old = SystemTime::now() - Duration::from_secs(100);
        let mid = SystemTime::now() - Duration::from_secs(60);

        write_with_mtime(&f.root.join("foo.lib"), b"imports", old);
        write_with_mtime(&f.root.join("foo.dll"), b"code", old);
        write_with_mtime(&f.root.join("tool"), b"bin", mid);

        // source newer than both outputs, so the producer itself is stale
        let producer = shared_library_producer(&f, SystemTime::now());
        let consumer = link(&f.registry, &f.root, &["foo.lib"], "tool");
        let graph = ActionGraph::link(vec![producer.clone(), consumer.clone()]).unwrap();

        {
            let analyzer = StalenessAnalyzer::new(&graph, f.context());
            analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
        }

        let analyzer = StalenessAnalyzer::new(&graph, f.context_ignoring_import_libraries());
        let stale = analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
        assert!(stale.contains(&ActionId(0)));
        assert!(!stale.contains(&ActionId(1)), "lib-only consumer must not inherit staleness");

        let analyzer = StalenessAnalyzer::new(&graph, f.context());
        let stale = analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
        assert!(stale.contains(&ActionId(1)));

        // a consumer of the shared library itself always inherits
        let dll_consumer = link(&f.registry, &f.root, &["foo.dll"], "app");
        write_with_mtime(&f.root.join("app"), b"bin", mid);
        let graph = ActionGraph::link(vec![producer, dll_consumer]).unwrap();
        {
            let analyzer = StalenessAnalyzer::new(&graph, f.context());
            analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
        }
        let analyzer = StalenessAnalyzer::new(&graph, f.context_ignoring_import_libraries());
        let stale = analyzer.gather(&graph.ids().collect::<Vec<_>>()).unwrap();
        assert!(stale.contains(&ActionId(1)));
    }

    #[test]
    fn path_length_validation() {
        let f = Fixture::new();
        let graph =
            ActionGraph::link(vec![compile(&f.registry, &f.root, "a.cpp", "a.o")]).unwrap();
        let ids: Vec<ActionId> = graph.ids().collect();
        graph.validate_output_path_lengths(&ids, &f.root, 180).unwrap();

        let long_name = format!("{}.o", "x".repeat(300));
        let graph =
            ActionGraph::link(vec![compile(&f.registry, &f.root, "a.cpp", &long_name)]).unwrap();
        let ids: Vec<ActionId> = graph.ids().collect();
        let err = graph.validate_output_path_lengths(&ids, &f.root, 180).unwrap_err();
        assert!(matches!(err, BuildError::OutputPathTooLong { .. }));
    }
}
