use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use pmgr_jobs::JobService;
use pmgr_workflow::{
    attempt::AttemptStore,
    inspect::SystemInspector,
    model::ScopedBundles,
    paths::Filesystem,
    process_worker::ProcessWorker,
    repatch::{RepatchStart, Repatcher},
    repo::{BundleRepository, PatchOptionsRepository, PatchSelectionRepository, Repositories},
    selection::{missing_patches, sanitize_options, sanitize_selection},
    start::{prepare_request, StartPlan},
    store::{BundleCatalog, JsonStore},
    InstallType, PatchWorkflow, Preferences, SelectedApp, WorkflowDeps, WorkflowRequest,
    WorkflowState,
};
use tracing::warn;

#[derive(Parser)]
#[command(name = "pmgr", version, about = "Patch manager workflow CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Patch an APK file or an installed package
    Patch {
        package: String,
        /// APK or split archive to patch; the installed package when omitted
        #[arg(long)]
        apk: Option<PathBuf>,
        #[arg(long)]
        version: Option<String>,
        /// Delete the input file when the workflow ends
        #[arg(long)]
        temporary: bool,
        #[arg(long)]
        allow_incompatible: bool,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Patch an installed app again from its stored original APK
    Repatch {
        /// Package name of the installed patched app
        package: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Show a package's saved selection checked against the current bundles
    Sanitize {
        package: String,
        #[arg(long)]
        version: Option<String>,
    },
    /// Preference commands
    Prefs {
        #[command(subcommand)]
        cmd: PrefsCmd,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Copy the patched APK here when done
    #[arg(long)]
    export: Option<PathBuf>,
    /// Accept warnings and memory-limit retries without stopping
    #[arg(long, short = 'y')]
    yes: bool,
}

#[derive(Subcommand)]
enum PrefsCmd {
    /// Print all preferences as JSON
    Show,
    /// Set the patcher process memory limit in MB
    SetMemoryLimit { limit_mb: u32 },
    /// Turn expert mode on or off
    ExpertMode {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Set the export file name template
    ExportTemplate { template: String },
}

struct App {
    prefs: Arc<Preferences>,
    repos: Repositories,
    fs: Filesystem,
}

impl App {
    fn open() -> Result<Self, Box<dyn std::error::Error>> {
        let fs = Filesystem::open_default()?;
        let catalog = match BundleCatalog::load(&BundleCatalog::default_path()) {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!("no patch bundles loaded ({err})");
                BundleCatalog::new(Vec::new())
            }
        };
        let store = Arc::new(JsonStore::open_default(fs.clone()));
        Ok(Self {
            prefs: Arc::new(Preferences::load(&Preferences::default_path())),
            repos: Repositories::from_store(store, Arc::new(catalog)),
            fs,
        })
    }

    fn deps(&self) -> WorkflowDeps {
        let inspector = Arc::new(SystemInspector);
        WorkflowDeps {
            jobs: JobService::from_env(),
            worker: Arc::new(ProcessWorker::from_env(self.prefs.clone(), inspector.clone())),
            prefs: self.prefs.clone(),
            repos: self.repos.clone(),
            inspector,
            fs: self.fs.clone(),
            attempts: Arc::new(AttemptStore::open_default()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pmgr_util::init_tracing()?;
    let cli = Cli::parse();
    let app = App::open()?;

    match cli.cmd {
        Cmd::Patch {
            package,
            apk,
            version,
            temporary,
            allow_incompatible,
            run,
        } => {
            let selected_app = match apk {
                Some(file) => SelectedApp::Local {
                    package_name: package,
                    version,
                    file,
                    temporary,
                    resolved: true,
                },
                None => SelectedApp::Installed {
                    package_name: package,
                    version,
                },
            };
            let allow_incompatible =
                allow_incompatible || app.prefs.snapshot().disable_patch_version_compat_check;
            let request = match prepare_request(&app.repos, &app.prefs, selected_app, allow_incompatible).await? {
                StartPlan::Review { request, bundles } => {
                    print_review(&request, &bundles);
                    request
                }
                StartPlan::Ready(request) => request,
            };
            run_workflow(app.deps(), request, &run).await?;
        }

        Cmd::Repatch { package, run } => {
            let repatcher = Repatcher::new(app.repos.clone());
            let request = match repatcher.start(&app.prefs, &package).await? {
                RepatchStart::Review { plan, bundles } => {
                    if plan.removed_patches > 0 {
                        println!("removed {} unavailable patches", plan.removed_patches);
                    }
                    let request = repatcher
                        .proceed(&plan, plan.selection.clone(), plan.options.clone())
                        .await?;
                    print_review(&request, &bundles);
                    request
                }
                RepatchStart::Ready(request) => request,
            };
            run_workflow(app.deps(), request, &run).await?;
        }

        Cmd::Sanitize { package, version } => {
            let bundles = app.repos.bundles.scoped_bundles(&package, version.as_deref())?;
            let selection = app.repos.selections.get_selection(&package)?;
            let sanitized = sanitize_selection(&selection, &bundles);
            for name in missing_patches(&selection, &sanitized) {
                println!("missing\t{name}");
            }
            for (uid, names) in &sanitized {
                for name in names {
                    println!("{uid}\t{name}");
                }
            }
            let (_, rejected) = sanitize_options(&app.repos.options.get_options(&package)?, &bundles);
            println!("rejected_options={rejected}");
        }

        Cmd::Prefs { cmd } => match cmd {
            PrefsCmd::Show => {
                println!("{}", serde_json::to_string_pretty(&app.prefs.snapshot())?);
            }
            PrefsCmd::SetMemoryLimit { limit_mb } => {
                app.prefs.set_process_memory_limit(limit_mb);
                println!("process_memory_limit_mb={}", app.prefs.process_memory_limit_mb());
            }
            PrefsCmd::ExpertMode { enabled } => {
                app.prefs.update(|values| values.use_expert_mode = enabled);
                println!("use_expert_mode={enabled}");
            }
            PrefsCmd::ExportTemplate { template } => {
                app.prefs
                    .update(|values| values.export_name_template = Some(template.clone()));
                println!("export_name_template={template}");
            }
        },
    }

    Ok(())
}

fn print_review(request: &WorkflowRequest, bundles: &ScopedBundles) {
    for (uid, names) in &request.selection {
        let bundle = bundles.get(uid).map(|b| b.name.as_str()).unwrap_or("?");
        for name in names {
            println!("{bundle}\t{name}");
        }
    }
}

/// Follows one workflow to the end, answering its prompts from `run`.
async fn run_workflow(
    deps: WorkflowDeps,
    request: WorkflowRequest,
    run: &RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let workflow = PatchWorkflow::open(deps, request).await?;
    let mut rx = workflow.subscribe();
    let mut last_line = String::new();

    loop {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(step) = snapshot.steps.get(snapshot.current_step) {
            let line = format!("[{:>3.0}%] {} ({:?})", snapshot.progress * 100.0, step.name, step.state);
            if line != last_line {
                println!("{line}");
                last_line = line;
            }
        }

        match snapshot.state {
            WorkflowState::MissingPatchesWarning => {
                println!("unavailable patches: {}", snapshot.missing_patches.join(", "));
                if run.yes {
                    workflow.remove_missing_patches_and_start().await?;
                } else {
                    workflow.dismiss_missing_patches().await?;
                    workflow.close().await;
                    return Err("stopped: selected patches are unavailable (use --yes to skip them)".into());
                }
            }
            WorkflowState::InaccessiblePathsWarning => {
                for failure in &snapshot.path_failures {
                    println!("unreadable option path: {} ({})", failure.path().display(), failure.patch_name());
                }
                workflow.dismiss_inaccessible_paths().await?;
                workflow.close().await;
                return Err("stopped: option paths are not readable".into());
            }
            WorkflowState::OomRecoveryOffered => {
                let Some(adjustment) = snapshot.memory_adjustment else {
                    workflow.close().await;
                    return Err("stopped: out of memory".into());
                };
                println!(
                    "patcher ran out of memory at {} MB; next limit {} MB",
                    adjustment.previous_limit, adjustment.new_limit
                );
                if run.yes && adjustment.adjusted {
                    workflow.retry_after_memory_adjustment().await?;
                } else {
                    workflow.dismiss_memory_adjustment().await?;
                    workflow.close().await;
                    return Err("stopped: out of memory".into());
                }
            }
            WorkflowState::Failed => {
                for entry in workflow.logs().await.iter().rev().take(20).rev() {
                    eprintln!("{:?}\t{}", entry.level, entry.message);
                }
                let message = snapshot
                    .failure
                    .and_then(|failure| failure.message)
                    .unwrap_or_else(|| "patching failed".to_string());
                workflow.close().await;
                return Err(message.into());
            }
            WorkflowState::Idle => {
                workflow.close().await;
                return Err("patching was cancelled".into());
            }
            WorkflowState::Done => break,
            _ => {}
        }

        if rx.changed().await.is_err() {
            break;
        }
    }

    match &run.export {
        Some(dest) => {
            let dest = if dest.is_dir() {
                dest.join(workflow.export_file_name().await)
            } else {
                dest.clone()
            };
            if !workflow.export(&dest).await {
                workflow.close().await;
                return Err(format!("could not export to {}", dest.display()).into());
            }
            println!("exported={}", dest.display());
        }
        None => {
            if !workflow.persist_patched_app(None, InstallType::Saved).await {
                warn!("patched app could not be recorded");
            }
            println!("output={}", workflow.output_file().display());
        }
    }
    workflow.close().await;
    Ok(())
}
