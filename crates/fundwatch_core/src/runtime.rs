use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR_NAME: &str = ".fundwatch";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const REGISTRY_FILENAME: &str = "registrants.toml";
pub const DB_FILENAME: &str = "fundwatch.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub registry_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ncache_dir={}\noutput_dir={}\ndb_path={}\nconfig_path={} ({})\nregistry_path={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.cache_dir),
            normalize_for_display(&self.output_dir),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.registry_path),
        )
    }

    /// Artifact folder for one registrant: `outputs/{id}`.
    pub fn registrant_output_dir(&self, registrant_id: &str) -> PathBuf {
        self.output_dir.join(registrant_id)
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
    pub wrote_registry: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;

    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = resolve_under_project(
        overrides.data_dir.as_deref(),
        lookup_env("FUNDWATCH_DATA_DIR"),
        &project_root,
        || state_dir.join("data"),
    );
    let (config_path, config_source) = resolve_under_project(
        overrides.config.as_deref(),
        lookup_env("FUNDWATCH_CONFIG"),
        &project_root,
        || state_dir.join(CONFIG_FILENAME),
    );

    Ok(ResolvedPaths {
        cache_dir: data_dir.join("cache"),
        db_path: data_dir.join(DB_FILENAME),
        output_dir: project_root.join("outputs"),
        registry_path: state_dir.join(REGISTRY_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = [
        paths.state_dir.clone(),
        paths.data_dir.clone(),
        paths.cache_dir.join("index"),
        paths.cache_dir.join("web"),
        paths.output_dir.clone(),
    ];
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(&paths.config_path, &render_materialized_config(), force)?;
    let wrote_registry = write_text_file(
        &paths.registry_path,
        crate::registry::REGISTRY_HEADER,
        false,
    )?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
        wrote_registry,
    })
}

pub fn render_materialized_config() -> String {
    format!(
        "# fundwatch runtime configuration (materialized by `fundwatch init`)\n\n[edgar]\n# Required: contact string sent on every request, e.g. \"Acme Research ops@acme.example\".\n# user_agent = \"\"\nrate_limit = {rate}\nmax_in_flight = {in_flight}\ntimeout_ms = {timeout}\nrefresh_max_age_hours = {fresh}\nmax_rate_limit_retries = 1\n\n[pipeline]\nworkers = {workers}\ntarget_prefixes = [\"485\", \"N-1A\"]\n# since = \"2024-01-01\"\n# until = \"2025-12-31\"\n",
        rate = crate::config::DEFAULT_RATE_LIMIT,
        in_flight = crate::config::DEFAULT_MAX_IN_FLIGHT,
        timeout = crate::config::DEFAULT_TIMEOUT_MS,
        fresh = crate::config::DEFAULT_REFRESH_MAX_AGE_HOURS,
        workers = crate::config::DEFAULT_WORKERS,
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = lookup_env("FUNDWATCH_PROJECT_ROOT") {
        return Ok((
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        ));
    }

    let root = detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    Ok((root, ValueSource::Heuristic))
}

/// Flag, then env (both relative to the project root), then the layout default.
fn resolve_under_project(
    flag: Option<&Path>,
    env_value: Option<String>,
    project_root: &Path,
    default: impl FnOnce() -> PathBuf,
) -> (PathBuf, ValueSource) {
    match (flag, env_value) {
        (Some(path), _) => (absolutize(path, project_root), ValueSource::Flag),
        (None, Some(value)) => (
            absolutize(Path::new(value.trim()), project_root),
            ValueSource::Env,
        ),
        (None, None) => (default(), ValueSource::Default),
    }
}

/// Nearest ancestor of the cwd, then of the executable, holding a state dir.
fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    cwd.ancestors()
        .chain(executable_dir.into_iter().flat_map(Path::ancestors))
        .filter(|candidate| seen.insert(candidate.to_path_buf()))
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map_or_else(|| cwd.to_path_buf(), Path::to_path_buf)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{PathOverrides, ResolutionContext, ValueSource, init_layout, resolve_paths_with_lookup};

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext {
            cwd: cwd.clone(),
            executable_dir: None,
        };
        let env = HashMap::from([(
            "FUNDWATCH_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.cache_dir, resolved.data_dir.join("cache"));
    }

    #[test]
    fn resolve_paths_uses_env_data_dir() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let env = HashMap::from([("FUNDWATCH_DATA_DIR".to_string(), "shared-data".to_string())]);

        let resolved = resolve_paths_with_lookup(
            &context,
            &PathOverrides {
                project_root: Some(root.clone()),
                ..PathOverrides::default()
            },
            |key| env.get(key).cloned(),
        )
        .expect("resolve");
        assert_eq!(resolved.data_dir, root.join("shared-data"));
        assert_eq!(resolved.data_source, ValueSource::Env);
        assert_eq!(resolved.db_path, root.join("shared-data").join("fundwatch.db"));
    }

    #[test]
    fn heuristic_root_finds_state_dir_in_ancestor() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a").join("b");
        fs::create_dir_all(root.join(".fundwatch")).expect("state dir");
        fs::create_dir_all(&nested).expect("nested");

        let context = ResolutionContext {
            cwd: nested,
            executable_dir: None,
        };
        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None).expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn init_layout_creates_expected_dirs_and_files() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let report = init_layout(&paths, false).expect("init");
        assert!(!report.created_dirs.is_empty());
        assert!(report.wrote_config);
        assert!(paths.cache_dir.join("index").exists());
        assert!(paths.cache_dir.join("web").exists());
        assert!(paths.config_path.exists());
        assert!(paths.registry_path.exists());

        let again = init_layout(&paths, false).expect("init again");
        assert!(again.created_dirs.is_empty());
        assert!(!again.wrote_config);
    }
}
