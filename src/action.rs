//! The atomic unit of work: one external process invocation with declared
//! inputs, outputs and command line.
//!
//! Actions are created by upstream rule evaluation, serialised into the
//! build's makefile artefact (binary archive) and reloaded on subsequent
//! runs; they can also be exchanged with other tooling as JSON.

use crate::{
    archive::{ArchiveReader, ArchiveWriter},
    error::{BuildError, Result},
    items::{FileItem, ItemRegistry},
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

/// Current version of the binary action archive. Readers that find another
/// version return no actions, which forces a full graph rebuild upstream.
const ACTION_ARCHIVE_VERSION: i32 = 1;

/// What an action does, as far as the engine cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    BuildProject,
    Compile,
    CreateAppBundle,
    GenerateDebugInfo,
    Link,
    WriteMetadata,
    PostBuildStep,
    ParseTimingInfo,
}

impl ActionKind {
    const ALL: [ActionKind; 8] = [
        ActionKind::BuildProject,
        ActionKind::Compile,
        ActionKind::CreateAppBundle,
        ActionKind::GenerateDebugInfo,
        ActionKind::Link,
        ActionKind::WriteMetadata,
        ActionKind::PostBuildStep,
        ActionKind::ParseTimingInfo,
    ];

    fn to_byte(self) -> u8 {
        Self::ALL.iter().position(|kind| *kind == self).unwrap() as u8
    }

    fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One external process invocation with its declared file-level contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    /// Directory the child process is spawned in.
    pub working_directory: PathBuf,
    /// Echo the full command line when the action starts.
    pub print_debug_info: bool,
    pub command_path: PathBuf,
    pub command_arguments: String,
    /// Human-facing description of the invoked tool, e.g. "Compile".
    pub command_description: String,
    /// Human-facing progress string, e.g. the source file name.
    pub status_description: String,
    /// Display groups this action belongs to.
    pub group_names: Vec<String>,
    pub can_execute_remotely: bool,
    pub can_execute_on_sdk_farm: bool,
    pub is_gcc_compiler: bool,
    /// The action emits an import library alongside its shared library.
    pub produces_import_library: bool,
    pub should_log_status: bool,
    /// Files that must exist and be up to date before this action runs.
    pub prerequisite_items: Vec<FileItem>,
    /// Files that exist after this action completes successfully.
    pub produced_items: Vec<FileItem>,
    /// Files removed before this action runs.
    pub delete_items: Vec<FileItem>,
    /// Compiler-emitted manifest of the files actually read last time.
    pub dependency_list_file: Option<FileItem>,
}

impl Action {
    /// A new action of `kind` with empty fields; callers fill in the rest.
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            working_directory: PathBuf::new(),
            print_debug_info: false,
            command_path: PathBuf::new(),
            command_arguments: String::new(),
            command_description: String::new(),
            status_description: String::new(),
            group_names: Vec::new(),
            can_execute_remotely: false,
            can_execute_on_sdk_farm: false,
            is_gcc_compiler: false,
            produces_import_library: false,
            should_log_status: true,
            prerequisite_items: Vec::new(),
            produced_items: Vec::new(),
            delete_items: Vec::new(),
            dependency_list_file: None,
        }
    }

    /// The full command line, as fingerprinted by the action history.
    pub fn command_line(&self) -> String {
        format!("{} {}", self.command_path.display(), self.command_arguments)
    }

    /// Human-readable field-by-field differences against `other`, used in
    /// producer conflict diagnostics. Empty when the actions are identical.
    pub fn describe_differences(&self, other: &Action) -> Vec<String> {
        fn diff<T: fmt::Debug + PartialEq>(
            out: &mut Vec<String>,
            field: &str,
            a: &T,
            b: &T,
        ) {
            if a != b {
                out.push(format!("  {field}: {a:?} vs {b:?}"));
            }
        }
        fn diff_items(out: &mut Vec<String>, field: &str, a: &[FileItem], b: &[FileItem]) {
            if a != b {
                let fmt_items = |items: &[FileItem]| {
                    items.iter().map(|i| i.path().display().to_string()).collect::<Vec<_>>()
                };
                out.push(format!("  {field}: {:?} vs {:?}", fmt_items(a), fmt_items(b)));
            }
        }

        let mut out = Vec::new();
        diff(&mut out, "kind", &self.kind, &other.kind);
        diff(&mut out, "working_directory", &self.working_directory, &other.working_directory);
        diff(&mut out, "print_debug_info", &self.print_debug_info, &other.print_debug_info);
        diff(&mut out, "command_path", &self.command_path, &other.command_path);
        diff(&mut out, "command_arguments", &self.command_arguments, &other.command_arguments);
        diff(
            &mut out,
            "command_description",
            &self.command_description,
            &other.command_description,
        );
        diff(&mut out, "status_description", &self.status_description, &other.status_description);
        diff(&mut out, "group_names", &self.group_names, &other.group_names);
        diff(
            &mut out,
            "can_execute_remotely",
            &self.can_execute_remotely,
            &other.can_execute_remotely,
        );
        diff(
            &mut out,
            "can_execute_on_sdk_farm",
            &self.can_execute_on_sdk_farm,
            &other.can_execute_on_sdk_farm,
        );
        diff(&mut out, "is_gcc_compiler", &self.is_gcc_compiler, &other.is_gcc_compiler);
        diff(
            &mut out,
            "produces_import_library",
            &self.produces_import_library,
            &other.produces_import_library,
        );
        diff(&mut out, "should_log_status", &self.should_log_status, &other.should_log_status);
        diff_items(&mut out, "prerequisite_items", &self.prerequisite_items, &other.prerequisite_items);
        diff_items(&mut out, "produced_items", &self.produced_items, &other.produced_items);
        diff_items(&mut out, "delete_items", &self.delete_items, &other.delete_items);
        diff(
            &mut out,
            "dependency_list_file",
            &self.dependency_list_file.as_ref().map(|f| f.path().to_path_buf()),
            &other.dependency_list_file.as_ref().map(|f| f.path().to_path_buf()),
        );
        out
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.command_description, self.status_description)
    }
}

/// JSON shape of a single action, path-valued rather than handle-valued.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionDescriptor {
    #[serde(rename = "Type")]
    pub kind: ActionKind,
    #[serde(rename = "WorkingDirectory")]
    pub working_directory: PathBuf,
    #[serde(rename = "PrintDebugInfo", default)]
    pub print_debug_info: bool,
    #[serde(rename = "CommandPath")]
    pub command_path: PathBuf,
    #[serde(rename = "CommandArguments")]
    pub command_arguments: String,
    #[serde(rename = "CommandDescription", default)]
    pub command_description: String,
    #[serde(rename = "StatusDescription", default)]
    pub status_description: String,
    #[serde(rename = "GroupNames", default)]
    pub group_names: Vec<String>,
    #[serde(rename = "CanExecuteRemotely", default)]
    pub can_execute_remotely: bool,
    #[serde(rename = "CanExecuteOnSdkFarm", default)]
    pub can_execute_on_sdk_farm: bool,
    #[serde(rename = "IsGccCompiler", default)]
    pub is_gcc_compiler: bool,
    #[serde(rename = "ProducesImportLibrary", default)]
    pub produces_import_library: bool,
    #[serde(rename = "ShouldLogStatus", default = "default_true")]
    pub should_log_status: bool,
    #[serde(rename = "PrerequisiteItems", default)]
    pub prerequisite_items: Vec<PathBuf>,
    #[serde(rename = "ProducedItems", default)]
    pub produced_items: Vec<PathBuf>,
    #[serde(rename = "DeleteItems", default)]
    pub delete_items: Vec<PathBuf>,
    #[serde(rename = "DependencyListFile", default, skip_serializing_if = "Option::is_none")]
    pub dependency_list_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl ActionDescriptor {
    pub fn from_action(action: &Action) -> Self {
        let paths = |items: &[FileItem]| items.iter().map(|i| i.path().to_path_buf()).collect();
        Self {
            kind: action.kind,
            working_directory: action.working_directory.clone(),
            print_debug_info: action.print_debug_info,
            command_path: action.command_path.clone(),
            command_arguments: action.command_arguments.clone(),
            command_description: action.command_description.clone(),
            status_description: action.status_description.clone(),
            group_names: action.group_names.clone(),
            can_execute_remotely: action.can_execute_remotely,
            can_execute_on_sdk_farm: action.can_execute_on_sdk_farm,
            is_gcc_compiler: action.is_gcc_compiler,
            produces_import_library: action.produces_import_library,
            should_log_status: action.should_log_status,
            prerequisite_items: paths(&action.prerequisite_items),
            produced_items: paths(&action.produced_items),
            delete_items: paths(&action.delete_items),
            dependency_list_file: action.dependency_list_file.as_ref().map(|f| f.path().into()),
        }
    }

    pub fn into_action(self, registry: &ItemRegistry) -> Action {
        let items = |paths: Vec<PathBuf>| paths.into_iter().map(|p| registry.file(p)).collect();
        Action {
            kind: self.kind,
            working_directory: self.working_directory,
            print_debug_info: self.print_debug_info,
            command_path: self.command_path,
            command_arguments: self.command_arguments,
            command_description: self.command_description,
            status_description: self.status_description,
            group_names: self.group_names,
            can_execute_remotely: self.can_execute_remotely,
            can_execute_on_sdk_farm: self.can_execute_on_sdk_farm,
            is_gcc_compiler: self.is_gcc_compiler,
            produces_import_library: self.produces_import_library,
            should_log_status: self.should_log_status,
            prerequisite_items: items(self.prerequisite_items),
            produced_items: items(self.produced_items),
            delete_items: items(self.delete_items),
            dependency_list_file: self.dependency_list_file.map(|p| registry.file(p)),
        }
    }
}

/// Top-level JSON graph file: environment overrides plus the action list.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActionGraphFile {
    /// Environment variables that differed from the launch environment when
    /// the file was written; all are re-exported on import.
    #[serde(rename = "Environment", default)]
    pub environment: BTreeMap<String, String>,
    #[serde(rename = "Actions", default)]
    pub actions: Vec<ActionDescriptor>,
}

impl ActionGraphFile {
    /// Captures `actions` plus whichever of `environment` differs from the
    /// current process environment.
    pub fn capture(actions: &[Action], environment: &BTreeMap<String, String>) -> Self {
        let environment = environment
            .iter()
            .filter(|(name, value)| std::env::var(name).ok().as_deref() != Some(value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let mut file =
            Self { environment, actions: actions.iter().map(ActionDescriptor::from_action).collect() };
        file.slash_paths();
        file
    }

    /// Converts all `\\` separators to `/` so the file reads the same on
    /// every host.
    ///
    /// This is a noop on other platforms.
    pub fn slash_paths(&mut self) {
        #[cfg(windows)]
        {
            use path_slash::PathBufExt;

            let slash = |path: &mut PathBuf| *path = PathBuf::from(path.to_slash_lossy().as_ref());
            for action in &mut self.actions {
                slash(&mut action.working_directory);
                slash(&mut action.command_path);
                action.prerequisite_items.iter_mut().for_each(slash);
                action.produced_items.iter_mut().for_each(slash);
                action.delete_items.iter_mut().for_each(slash);
                if let Some(path) = &mut action.dependency_list_file {
                    slash(path);
                }
            }
        }
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        utils::create_parent_dir_all(path)?;
        utils::write_json_file(self, path)?;
        trace!("wrote action graph with {} actions to \"{}\"", self.actions.len(), path.display());
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        utils::read_json_file(path)
    }

    /// Re-exports the recorded environment and links the descriptors into
    /// `registry`-interned actions.
    pub fn import(self, registry: &ItemRegistry) -> Vec<Action> {
        for (name, value) in &self.environment {
            std::env::set_var(name, value);
        }
        self.actions.into_iter().map(|descriptor| descriptor.into_action(registry)).collect()
    }
}

/// Writes `actions` into the binary makefile archive at `path`.
///
/// Field order is fixed and must match [`read_action_archive`] exactly.
pub fn write_action_archive(path: impl AsRef<Path>, actions: &[Action]) -> Result<()> {
    let mut writer = ArchiveWriter::new();
    writer.write_i32(ACTION_ARCHIVE_VERSION);
    writer.write_u32(actions.len() as u32);
    for action in actions {
        writer.write_u8(action.kind.to_byte());
        writer.write_path(&action.working_directory);
        writer.write_bool(action.print_debug_info);
        writer.write_path(&action.command_path);
        writer.write_str(&action.command_arguments);
        writer.write_str(&action.command_description);
        writer.write_str(&action.status_description);
        writer.write_str_list(&action.group_names);
        writer.write_bool(action.can_execute_remotely);
        writer.write_bool(action.can_execute_on_sdk_farm);
        writer.write_bool(action.is_gcc_compiler);
        writer.write_bool(action.produces_import_library);
        writer.write_bool(action.should_log_status);
        for items in [&action.prerequisite_items, &action.produced_items, &action.delete_items] {
            writer.write_u32(items.len() as u32);
            for item in items.iter() {
                writer.write_path(item.path());
            }
        }
        writer.write_opt_str(
            action.dependency_list_file.as_ref().map(|f| f.path().to_string_lossy()).as_deref(),
        );
    }
    utils::replace_file(path.as_ref(), &writer.into_bytes())
}

/// Reads the binary makefile archive at `path`.
///
/// Returns `Ok(None)` when the file is missing or was written with a
/// different format version; the caller rebuilds the graph from scratch.
pub fn read_action_archive(
    path: impl AsRef<Path>,
    registry: &ItemRegistry,
) -> Result<Option<Vec<Action>>> {
    let path = path.as_ref();
    let Ok(bytes) = fs::read(path) else { return Ok(None) };
    let mut reader = ArchiveReader::new(path, &bytes);

    let version = reader.read_i32()?;
    if version != ACTION_ARCHIVE_VERSION {
        warn!(
            "action archive \"{}\" has version {version}, expected {ACTION_ARCHIVE_VERSION}; rebuilding",
            path.display()
        );
        return Ok(None);
    }

    let count = reader.read_u32()?;
    let mut actions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind_byte = reader.read_u8()?;
        let kind = ActionKind::from_byte(kind_byte).ok_or_else(|| BuildError::CorruptArchive {
            path: path.to_path_buf(),
            message: format!("invalid action kind byte {kind_byte}"),
        })?;
        let mut action = Action::new(kind);
        action.working_directory = reader.read_path()?;
        action.print_debug_info = reader.read_bool()?;
        action.command_path = reader.read_path()?;
        action.command_arguments = reader.read_str()?;
        action.command_description = reader.read_str()?;
        action.status_description = reader.read_str()?;
        action.group_names = reader.read_str_list()?;
        action.can_execute_remotely = reader.read_bool()?;
        action.can_execute_on_sdk_farm = reader.read_bool()?;
        action.is_gcc_compiler = reader.read_bool()?;
        action.produces_import_library = reader.read_bool()?;
        action.should_log_status = reader.read_bool()?;
        for items in [
            &mut action.prerequisite_items,
            &mut action.produced_items,
            &mut action.delete_items,
        ] {
            let len = reader.read_u32()?;
            for _ in 0..len {
                items.push(registry.file(reader.read_path()?));
            }
        }
        action.dependency_list_file = reader.read_opt_str()?.map(|p| registry.file(p));
        actions.push(action);
    }
    Ok(Some(actions))
}
