//! Supported languages and how each one is built and run inside a sandbox.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Marker printed by the Python plot-capture prelude. Sessions strip it from
/// stdout before returning results.
pub const PLOT_SETUP_MESSAGE: &str = "Python plot detection setup complete";

/// A language the proxy can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Java,
    Cpp,
    Go,
    R,
}

impl Language {
    pub const ALL: [Self; 6] = [
        Self::Python,
        Self::JavaScript,
        Self::Java,
        Self::Cpp,
        Self::Go,
        Self::R,
    ];

    /// Canonical lowercase name, as used in configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::Java => "java",
            Self::Cpp => "cpp",
            Self::Go => "go",
            Self::R => "r",
        }
    }

    /// Resolve a canonical name or a common shorthand (`py`, `js`, `c++`, ...).
    pub fn from_alias(name: &str) -> Option<Self> {
        let lang = match name.trim().to_ascii_lowercase().as_str() {
            "py" | "python" => Self::Python,
            "js" | "javascript" | "ts" | "typescript" => Self::JavaScript,
            "java" => Self::Java,
            "cpp" | "c++" | "c" => Self::Cpp,
            "go" | "golang" => Self::Go,
            "r" => Self::R,
            _ => return None,
        };
        Some(lang)
    }

    /// File name the source is written to before execution.
    pub const fn source_file(self) -> &'static str {
        match self {
            Self::Python => "main.py",
            Self::JavaScript => "main.js",
            Self::Java => "Main.java",
            Self::Cpp => "main.cpp",
            Self::Go => "main.go",
            Self::R => "main.R",
        }
    }

    /// Shell command that builds (if needed) and runs the source stored in
    /// `src_dir`. The caller sets the session working directory as cwd.
    pub fn run_command(self, src_dir: &str, args: &[String]) -> String {
        let src = format!("{src_dir}/{}", self.source_file());
        let command = match self {
            Self::Python => format!("python3 {src}"),
            Self::JavaScript => format!("node {src}"),
            Self::Java => format!("javac -d {src_dir} {src} && java -cp {src_dir} Main"),
            Self::Cpp => format!("g++ -O2 -std=c++17 -o {src_dir}/main {src} && {src_dir}/main"),
            Self::Go => format!("go build -o {src_dir}/main {src} && {src_dir}/main"),
            Self::R => format!("Rscript {src}"),
        };
        if args.is_empty() {
            command
        } else {
            let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
            format!("{command} {}", quoted.join(" "))
        }
    }

    /// Full source to write for this run. Python gets the plot-capture
    /// prelude prepended when `plot_dir` is set.
    pub fn prepare_source(self, code: &str, plot_dir: Option<&str>) -> String {
        match (self, plot_dir) {
            (Self::Python, Some(dir)) => {
                let prelude = PYTHON_PLOT_PRELUDE.replace("__PLOT_DIR__", dir);
                format!("{prelude}\n{code}")
            }
            _ => code.to_string(),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_alias(s)
            .ok_or_else(|| ProxyError::validation(format!("Language '{s}' is not supported")))
    }
}

/// Quote a value for safe interpolation into a POSIX shell command.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Saves every open matplotlib figure on `plt.show()` and at interpreter exit.
/// File names encode `<index>-<width>x<height>-<dpi>`.
const PYTHON_PLOT_PRELUDE: &str = r#"import atexit as _ci_atexit
import os as _ci_os
try:
    import matplotlib as _ci_mpl
    _ci_mpl.use("Agg")
    import matplotlib.pyplot as _ci_plt

    def _ci_save_figures(*_args, **_kwargs):
        _ci_os.makedirs("__PLOT_DIR__", exist_ok=True)
        for _num in _ci_plt.get_fignums():
            _fig = _ci_plt.figure(_num)
            _dpi = int(_fig.dpi)
            _w, _h = (int(round(v * _dpi)) for v in _fig.get_size_inches())
            _idx = len(_ci_os.listdir("__PLOT_DIR__"))
            _fig.savefig(
                _ci_os.path.join("__PLOT_DIR__", "plot-%d-%dx%d-%d.png" % (_idx, _w, _h, _dpi)),
                dpi=_dpi,
            )
        _ci_plt.close("all")

    _ci_plt.show = _ci_save_figures
    _ci_atexit.register(_ci_save_figures)
    print("Python plot detection setup complete")
except ImportError:
    pass
"#;
