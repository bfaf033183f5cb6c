use serde::{Deserialize, Serialize};

/// Category an action belongs to, for listings and stats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    /// Filesystem operations.
    File,
    /// Code and shell execution.
    Code,
    /// Browser-adjacent operations.
    Browser,
    /// HTTP and search operations.
    Api,
    /// System tooling (packages, tests, git).
    System,
    /// Knowledge-plane operations.
    Nexus,
}

/// The closed set of registered actions. One variant per action; dispatch is
/// a match, registered once at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Read a file.
    ReadFile,
    /// Write (overwrite) a file.
    WriteFile,
    /// Replace the first occurrence of a string in a file.
    EditFile,
    /// Delete a file or directory.
    DeleteFile,
    /// List directory contents.
    ListDirectory,
    /// Create a directory tree.
    CreateDirectory,
    /// Execute Python code in a subprocess with a result envelope.
    RunPython,
    /// Execute a shell command.
    RunShell,
    /// Run a script file, dispatching by extension.
    RunScript,
    /// Open a URL or file with the system opener.
    OpenBrowser,
    /// Fetch a URL and report its title/status.
    NavigateUrl,
    /// Capture a page screenshot (requires a browser runtime).
    TakeScreenshot,
    /// HTTP GET.
    HttpGet,
    /// HTTP POST.
    HttpPost,
    /// Web search.
    WebSearch,
    /// Install a package via pip/npm.
    InstallPackage,
    /// Run a test suite.
    RunTests,
    /// `git status --short`.
    GitStatus,
    /// `git add` + `git commit`.
    GitCommit,
    /// Store knowledge through the bridge.
    LearnKnowledge,
    /// Query knowledge through the bridge.
    QueryKnowledge,
    /// Enqueue a task record.
    CreateTask,
    /// Static analysis of a source file.
    AnalyzeCode,
}

impl ActionKind {
    /// All registered kinds, in listing order.
    pub const ALL: [Self; 23] = [
        Self::ReadFile,
        Self::WriteFile,
        Self::EditFile,
        Self::DeleteFile,
        Self::ListDirectory,
        Self::CreateDirectory,
        Self::RunPython,
        Self::RunShell,
        Self::RunScript,
        Self::OpenBrowser,
        Self::NavigateUrl,
        Self::TakeScreenshot,
        Self::HttpGet,
        Self::HttpPost,
        Self::WebSearch,
        Self::InstallPackage,
        Self::RunTests,
        Self::GitStatus,
        Self::GitCommit,
        Self::LearnKnowledge,
        Self::QueryKnowledge,
        Self::CreateTask,
        Self::AnalyzeCode,
    ];

    /// Canonical snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::EditFile => "edit_file",
            Self::DeleteFile => "delete_file",
            Self::ListDirectory => "list_directory",
            Self::CreateDirectory => "create_directory",
            Self::RunPython => "run_python",
            Self::RunShell => "run_shell",
            Self::RunScript => "run_script",
            Self::OpenBrowser => "open_browser",
            Self::NavigateUrl => "navigate_url",
            Self::TakeScreenshot => "take_screenshot",
            Self::HttpGet => "http_get",
            Self::HttpPost => "http_post",
            Self::WebSearch => "web_search",
            Self::InstallPackage => "install_package",
            Self::RunTests => "run_tests",
            Self::GitStatus => "git_status",
            Self::GitCommit => "git_commit",
            Self::LearnKnowledge => "learn_knowledge",
            Self::QueryKnowledge => "query_knowledge",
            Self::CreateTask => "create_task",
            Self::AnalyzeCode => "analyze_code",
        }
    }

    /// Resolves a caller-supplied name. Dashes alias to underscores, so
    /// `read-file` resolves to [`Self::ReadFile`].
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let normalised = name.trim().to_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|kind| kind.as_str() == normalised)
    }

    /// Listing category.
    #[must_use]
    pub const fn category(self) -> ActionCategory {
        match self {
            Self::ReadFile
            | Self::WriteFile
            | Self::EditFile
            | Self::DeleteFile
            | Self::ListDirectory
            | Self::CreateDirectory => ActionCategory::File,
            Self::RunPython | Self::RunShell | Self::RunScript => ActionCategory::Code,
            Self::OpenBrowser | Self::NavigateUrl | Self::TakeScreenshot => ActionCategory::Browser,
            Self::HttpGet | Self::HttpPost | Self::WebSearch => ActionCategory::Api,
            Self::InstallPackage | Self::RunTests | Self::GitStatus | Self::GitCommit => {
                ActionCategory::System
            }
            Self::LearnKnowledge | Self::QueryKnowledge | Self::CreateTask | Self::AnalyzeCode => {
                ActionCategory::Nexus
            }
        }
    }

    /// Whether the action mutates the path it targets.
    #[must_use]
    pub const fn mutates_path(self) -> bool {
        matches!(
            self,
            Self::WriteFile | Self::EditFile | Self::DeleteFile | Self::CreateDirectory
        )
    }

    /// Whether the action takes a `path` parameter that must pass the gate.
    #[must_use]
    pub const fn checks_path(self) -> bool {
        matches!(
            self,
            Self::ReadFile
                | Self::WriteFile
                | Self::EditFile
                | Self::DeleteFile
                | Self::ListDirectory
                | Self::CreateDirectory
                | Self::RunScript
                | Self::AnalyzeCode
        )
    }
}
