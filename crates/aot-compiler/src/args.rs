//! Compile request validation and command-line construction.
//!
//! A request is an untyped string map. [`ArgsHandler::handle`] extracts the
//! bundle identity and artifact fields, picks the backend from the
//! `codeLanguage` tag, and builds the compiler's argument vector.
//!
//! Two backends exist and take incompatible argument conventions:
//!
//! - **dynamic** (`ark_aot_compiler`): pass-through `--key=value` flags and
//!   the bytecode archive as the final positional argument.
//! - **static** (`ark_aot`, also used for `hybrid`): fixed defaults, a boot
//!   class path read from a JSON manifest, `--paoc-*` flags.

use log::{debug, error, warn};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CompilerConfig;
use crate::error::{AotError, AotResult};
use crate::protocol::RequestArgs;

pub const BUNDLE_UID: &str = "BundleUid";
pub const BUNDLE_GID: &str = "BundleGid";
pub const AN_FILE_NAME: &str = "anFileName";
pub const APP_SIGNATURE: &str = "appIdentifier";
pub const ABC_PATH: &str = "ABC-Path";
pub const CODE_LANGUAGE: &str = "codeLanguage";
pub const TARGET_COMPILER_MODE: &str = "target-compiler-mode";
pub const COMPILER_PKG_INFO: &str = "compiler-pkg-info";
pub const AOT_FILE: &str = "aot-file";

const PREFIX: &str = "--";
const EQ: &str = "=";
const COLON: &str = ":";
const STATIC_AN_SUFFIX: &str = ".an";
const BOOT_PATH_KEY: &str = "bootpath";

/// Flags the dynamic compiler accepts verbatim from callers.
const DYNAMIC_ARGS_ALLOW_LIST: &[&str] = &[
    "aot-file",
    "ark-properties",
    "ark-bundleName",
    "asm-interpreter",
    "asm-opcode-disable-range",
    "builtins-lazy",
    "compiler-log",
    "compiler-log-methods",
    "compiler-log-snapshot",
    "compiler-log-time",
    "compiler-type-threshold",
    "enable-ic",
    "enable-runtime-stat",
    "log-components",
    "log-debug",
    "log-error",
    "log-fatal",
    "log-info",
    "log-level",
    "log-warning",
    "gc-long-paused-time",
    "compiler-opt-max-method",
    "compiler-module-methods",
    "entry-point",
    "force-full-gc",
    "gc-thread-num",
    "heap-size-limit",
    "icu-data-path",
    "enable-worker",
    "max-unmovable-space",
    "merge-abc",
    "enable-context",
    "compiler-opt-level",
    "reloc-mode",
    "serializer-buffer-size-limit",
    "startup-time",
    "stub-file",
    "compiler-target-triple",
    "enable-print-execute-time",
    "enable-pgo-profiler",
    "enable-elements-kind",
    "compiler-pgo-profiler-path",
    "compiler-pgo-hotness-threshold",
    "compiler-pgo-save-min-interval",
    "compiler-verify-vtable",
    "compiler-select-methods",
    "compiler-skip-methods",
    "target-compiler-mode",
    "hap-path",
    "hap-abc-offset",
    "hap-abc-size",
    "compiler-device-state",
    "compiler-pkg-info",
    "compiler-external-pkg-info",
    "compiler-enable-external-pkg",
    "compiler-opt-type-lowering",
    "compiler-opt-early-elimination",
    "compiler-opt-later-elimination",
    "compiler-opt-string",
    "compiler-opt-value-numbering",
    "compiler-opt-inlining",
    "compiler-opt-pgotype",
    "compiler-opt-track-field",
    "compiler-opt-loop-peeling",
    "compiler-opt-array-bounds-check-elimination",
    "compiler-opt-on-heap-check",
    "compiler-enable-lexenv-specialization",
    "compiler-enable-native-inline",
    "compiler-enable-lowering-builtin",
    "compiler-enable-litecg",
    "compiler-enable-jit",
    "compiler-enable-osr",
    "compiler-trace-jit",
    "compiler-enable-pgo-space",
    "compiler-baseline-pgo",
    "compiler-opt-frame-state-elimination",
    "compiler-emptycatch-function",
    "compiler-enable-concurrent",
    "compile-enable-jit-verify-pass",
];

/// Flags the static compiler accepts verbatim from callers.
const STATIC_ARGS_ALLOW_LIST: &[&str] = &[
    "paoc-mode",
    "paoc-skip-until",
    "paoc-compile-until",
    "paoc-methods-from-file",
    "paoc-use-cha",
    "paoc-verbose",
    "compiler-check-final",
    "compiler-ignore-failures",
    "compiler-enable-events",
    "compiler-events-path",
    "compiler-inline-external-methods",
    "compiler-inlining",
    "compiler-max-bytecode-size",
    "compiler-regex",
    "log-level",
    "log-components",
];

/// Flags always passed to the static compiler.
const STATIC_DEFAULT_ARGS: &[&str] = &[
    "--load-runtimes=ets",
    "--compiler-check-final=true",
    "--compiler-ignore-failures=false",
];

/// Arguments for one compiler invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HapArgs {
    /// Command line; `argv[0]` is the compiler executable.
    pub argv: Vec<String>,
    /// Artifact the compiler writes; signed on success, removed on stop.
    pub file_name: String,
    /// App identity the artifact is signed for.
    pub signature: String,
    pub bundle_uid: u32,
    pub bundle_gid: u32,
}

impl HapArgs {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn file_path(&self) -> &Path {
        Path::new(&self.file_name)
    }
}

/// Builds the command line for the dynamic compiler.
#[derive(Debug, Clone)]
pub struct DynamicParser {
    compiler: PathBuf,
    an_file_max_size: Option<String>,
    enable_code_comment: bool,
}

/// Builds the command line for the static compiler.
#[derive(Debug, Clone)]
pub struct StaticParser {
    compiler: PathBuf,
    boot_path_manifest: PathBuf,
}

/// The backend chosen for a request.
#[derive(Debug, Clone)]
pub enum ArgsParser {
    Dynamic(DynamicParser),
    Static(StaticParser),
}

impl ArgsParser {
    /// Pick the parser named by the request's `codeLanguage` tag.
    pub fn select(args: &RequestArgs, config: &CompilerConfig) -> AotResult<Self> {
        let language = args
            .get(CODE_LANGUAGE)
            .map(String::as_str)
            .unwrap_or("dynamic");

        match language {
            "dynamic" => Ok(Self::Dynamic(DynamicParser {
                compiler: config.dynamic_compiler.clone(),
                an_file_max_size: config.an_file_max_size.clone(),
                enable_code_comment: config.enable_code_comment,
            })),
            "static" | "hybrid" => Ok(Self::Static(StaticParser {
                compiler: config.static_compiler.clone(),
                boot_path_manifest: config.boot_path_manifest.clone(),
            })),
            other => {
                error!("unsupported code language '{other}'");
                Err(AotError::param(format!("unsupported code language '{other}'")))
            }
        }
    }

    pub fn parse(&self, args: &RequestArgs, thermal_level: i32) -> AotResult<HapArgs> {
        match self {
            Self::Dynamic(parser) => parser.parse(args, thermal_level),
            Self::Static(parser) => parser.parse(args),
        }
    }
}

/// Validates one request and builds its [`HapArgs`].
#[derive(Debug, Clone)]
pub struct ArgsHandler {
    config: CompilerConfig,
}

impl ArgsHandler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn handle(&self, args: &RequestArgs, thermal_level: i32) -> AotResult<HapArgs> {
        if args.is_empty() {
            return Err(AotError::param("empty request"));
        }
        let parser = ArgsParser::select(args, &self.config)?;
        let hap_args = parser.parse(args, thermal_level)?;
        debug!("compiler command line: {:?}", hap_args.argv);
        Ok(hap_args)
    }
}

/// Identity and artifact fields common to both backends.
struct RequiredFields {
    bundle_uid: u32,
    bundle_gid: u32,
    file_name: String,
    signature: String,
    abc_path: String,
}

impl RequiredFields {
    fn extract(args: &RequestArgs) -> AotResult<Self> {
        Ok(Self {
            bundle_uid: find_args_idx_to_integer(args, BUNDLE_UID)?,
            bundle_gid: find_args_idx_to_integer(args, BUNDLE_GID)?,
            file_name: find_args_idx_to_string(args, AN_FILE_NAME)?.to_string(),
            signature: find_args_idx_to_string(args, APP_SIGNATURE)?.to_string(),
            abc_path: find_args_idx_to_string(args, ABC_PATH)?.to_string(),
        })
    }

    fn into_hap_args(self, argv: Vec<String>) -> HapArgs {
        HapArgs {
            argv,
            file_name: self.file_name,
            signature: self.signature,
            bundle_uid: self.bundle_uid,
            bundle_gid: self.bundle_gid,
        }
    }
}

/// Read `key` as a non-negative integer.
///
/// The value must be the exact decimal rendering of the integer: no sign,
/// no leading zeros, no surrounding or trailing characters.
pub fn find_args_idx_to_integer(args: &RequestArgs, key: &str) -> AotResult<u32> {
    let raw = args
        .get(key)
        .ok_or_else(|| AotError::param(format!("missing {key}")))?;
    let value: u32 = raw
        .parse()
        .map_err(|_| AotError::param(format!("{key} is not an integer: {raw:?}")))?;
    if value.to_string() != *raw {
        return Err(AotError::param(format!("{key} has trailing characters: {raw:?}")));
    }
    Ok(value)
}

pub fn find_args_idx_to_string<'a>(args: &'a RequestArgs, key: &str) -> AotResult<&'a str> {
    args.get(key)
        .map(String::as_str)
        .ok_or_else(|| AotError::param(format!("missing {key}")))
}

fn flag(key: &str, value: &str) -> String {
    format!("{PREFIX}{key}{EQ}{value}")
}

impl DynamicParser {
    pub fn parse(&self, args: &RequestArgs, thermal_level: i32) -> AotResult<HapArgs> {
        let fields = RequiredFields::extract(args)?;

        let mut argv = vec![self.compiler.to_string_lossy().into_owned()];
        argv.push(flag("compiler-thermal-level", &thermal_level.to_string()));
        argv.extend(
            args.iter()
                .filter(|(key, _)| DYNAMIC_ARGS_ALLOW_LIST.contains(&key.as_str()))
                .map(|(key, value)| flag(key, value)),
        );
        if let Some(max_size) = &self.an_file_max_size {
            argv.push(flag("compiler-an-file-max-size", max_size));
        }
        if self.enable_code_comment {
            argv.push(flag("compiler-enable-aot-code-comment", "true"));
        }
        argv.push(fields.abc_path.clone());

        Ok(fields.into_hap_args(argv))
    }
}

impl StaticParser {
    pub fn parse(&self, args: &RequestArgs) -> AotResult<HapArgs> {
        let fields = RequiredFields::extract(args)?;

        let mut argv = vec![self.compiler.to_string_lossy().into_owned()];
        argv.extend(STATIC_DEFAULT_ARGS.iter().map(|arg| arg.to_string()));

        let boot_files = read_boot_panda_files(&self.boot_path_manifest)?;
        argv.push(flag("boot-panda-files", &boot_files));

        if let Some(output) = args.get(AOT_FILE) {
            argv.push(flag("paoc-output", &format!("{output}{STATIC_AN_SUFFIX}")));
        }
        argv.extend(
            args.iter()
                .filter(|(key, _)| STATIC_ARGS_ALLOW_LIST.contains(&key.as_str()))
                .map(|(key, value)| flag(key, value)),
        );

        let Some((_, location)) = fields.file_name.rsplit_once('/') else {
            error!("{AN_FILE_NAME} has no path separator: {}", fields.file_name);
            return Err(AotError::param(format!(
                "{AN_FILE_NAME} must be an absolute path: {}",
                fields.file_name
            )));
        };
        argv.push(flag("paoc-location", location));
        argv.push(flag("paoc-panda-files", &fields.abc_path));

        Ok(fields.into_hap_args(argv))
    }
}

/// Fold the boot class path manifest into one colon-joined string.
///
/// The `bootpath` entry may be a colon-joined string or an array of strings.
fn read_boot_panda_files(manifest: &Path) -> AotResult<String> {
    let contents = fs::read_to_string(manifest).map_err(|e| {
        warn!("failed to read boot path manifest {}: {e}", manifest.display());
        AotError::param(format!("boot path manifest unreadable: {e}"))
    })?;
    let json: Value = serde_json::from_str(&contents)
        .map_err(|e| AotError::param(format!("boot path manifest is not JSON: {e}")))?;

    let mut entries = Vec::new();
    match json.get(BOOT_PATH_KEY) {
        Some(Value::String(joined)) => {
            entries.extend(joined.split(COLON).filter(|s| !s.is_empty()).map(String::from));
        }
        Some(Value::Array(items)) => {
            entries.extend(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            );
        }
        _ => {}
    }

    if entries.is_empty() {
        return Err(AotError::param(format!(
            "boot path manifest {} has no entries",
            manifest.display()
        )));
    }
    Ok(entries.join(COLON))
}
