use anyhow::Result;
use atelier::cli::{Cli, Commands};
use atelier::config::Config;
use atelier::manager::{DeleteOptions, SpawnOptions};
use atelier::orchestrator::Orchestrator;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atelier=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: {}; continuing with defaults", e);
        Config::default()
    });
    let base_dir = Config::base_dir()?;
    let orchestrator = Orchestrator::new(config, &base_dir)?;

    match run(&orchestrator, cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(orchestrator: &Orchestrator, cli: Cli) -> atelier::Result<()> {
    match cli.command {
        Commands::Spawn {
            issue_number,
            mode,
            prompt_sections,
        } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let record = orchestrator
                .spawn(
                    &repo_id,
                    issue_number,
                    SpawnOptions {
                        mode: mode.map(Into::into),
                        additional_prompt_sections: prompt_sections,
                    },
                )
                .await?;
            println!("Spawned session {} ({} mode)", record.session_id, record.mode);
            println!("  Issue:    #{} {}", record.issue.number, record.issue.title);
            println!("  Branch:   {}", record.branch_name);
            println!("  Worktree: {}", record.worktree_path.display());
        }

        Commands::List { verbose } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let manager = orchestrator.manager(&repo_id)?;
            let listings = manager.list_with_cleanup_info()?;
            if listings.is_empty() {
                println!("No sessions");
                return Ok(());
            }
            for listing in listings {
                let record = &listing.record;
                let stale = if manager.is_stale(record) { " (stale)" } else { "" };
                let missing = if listing.worktree_missing {
                    " [worktree missing]"
                } else {
                    ""
                };
                println!(
                    "  {} [{}]{} #{} {}{}",
                    record.session_id, record.status, stale, record.issue.number,
                    record.issue.title, missing
                );
                if verbose {
                    println!("      branch:   {}", record.branch_name);
                    println!("      worktree: {}", record.worktree_path.display());
                    if let Some(url) = &record.pr_url {
                        println!("      pr:       {}", url);
                    }
                    if let Some(reason) = &record.stuck_reason {
                        println!("      stuck:    {}", reason);
                    }
                    if let Some(state) = orchestrator.ralph().state_of(&repo_id, &record.session_id)
                    {
                        println!(
                            "      loop:     iteration {}/{}, {:?}",
                            state.current_iteration, state.target_iterations, state.state
                        );
                    }
                }
            }
        }

        Commands::Status { session_id } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let manager = orchestrator.manager(&repo_id)?;
            let record = manager
                .get(&session_id)
                .ok_or(atelier::AtelierError::SessionNotFound(session_id.clone()))?;
            println!("Session {}", record.session_id);
            println!("  Status:    {}", record.status);
            println!("  Mode:      {}", record.mode);
            println!("  Issue:     #{} {}", record.issue.number, record.issue.title);
            println!("  Branch:    {}", record.branch_name);
            println!("  Worktree:  {}", record.worktree_path.display());
            println!("  Started:   {}", record.started_at.to_rfc3339());
            println!("  Heartbeat: {}", record.last_heartbeat.to_rfc3339());
            if let Some(url) = &record.pr_url {
                println!("  PR:        {}", url);
            }
            if let Some(reason) = &record.stuck_reason {
                println!("  Stuck:     {}", reason);
            }
            if let Some(message) = &record.forwarded_message {
                println!("  Pending:   {}", message);
            }
            let diff = manager.get_worktree_status(&session_id).await?;
            println!(
                "  Diff:      {} files, +{} -{}",
                diff.files_changed, diff.insertions, diff.deletions
            );
            let pending = manager
                .git()
                .uncommitted_and_unpushed_counts(&record.worktree_path)
                .await;
            println!(
                "  Pending:   {} uncommitted files, {} unpushed commits",
                pending.uncommitted_files, pending.unpushed_commits
            );
            if let Some(state) = manager.get_worktree_state(&session_id)? {
                println!(
                    "  Worktree state: {} (updated {})",
                    state.status,
                    state.last_updated.to_rfc3339()
                );
            }
        }

        Commands::Pause { session_id } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let record = orchestrator.manager(&repo_id)?.pause(&session_id).await?;
            println!("Session {} is {}", record.session_id, record.status);
        }

        Commands::Resume { session_id } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let record = orchestrator.manager(&repo_id)?.resume(&session_id).await?;
            println!("Session {} is {}", record.session_id, record.status);
        }

        Commands::Forward {
            session_id,
            message,
        } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            orchestrator
                .manager(&repo_id)?
                .forward(&session_id, &message)
                .await?;
            println!("Forwarded to session {}", session_id);
        }

        Commands::Heartbeat { session_id } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let result = orchestrator
                .manager(&repo_id)?
                .heartbeat(&session_id)
                .await?;
            if result.has_message {
                println!("heartbeat recorded; message waiting");
            } else {
                println!("heartbeat recorded");
            }
        }

        Commands::Ack { session_id } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            orchestrator
                .manager(&repo_id)?
                .acknowledge_message(&session_id)
                .await?;
            println!("Acknowledged");
        }

        Commands::Restart {
            session_id,
            iteration,
        } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let record = orchestrator
                .manager(&repo_id)?
                .restart(&session_id, iteration)
                .await?;
            println!(
                "Restarted session {} (spawn {})",
                record.session_id,
                record.spawn_id.as_deref().unwrap_or("?")
            );
        }

        Commands::Delete {
            session_id,
            force,
            mode,
            keep_working_copy,
        } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let result = orchestrator
                .delete(
                    &repo_id,
                    &session_id,
                    DeleteOptions {
                        keep_working_copy,
                        force,
                        deletion_mode: mode.into(),
                    },
                )
                .await?;
            if result.success {
                println!("Deleted session {}", session_id);
            } else if result.in_progress {
                println!("Deletion already in progress");
            } else {
                eprintln!(
                    "Deletion failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
                if let Some(path) = result.orphaned_worktree_path {
                    eprintln!("Worktree left at {}", path.display());
                    eprintln!("Use retry-delete or rollback-delete to continue");
                }
                std::process::exit(1);
            }
        }

        Commands::RetryDelete { session_id } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let result = orchestrator
                .manager(&repo_id)?
                .retry_delete(&session_id, DeleteOptions::default())
                .await?;
            if result.success {
                println!("Deleted session {}", session_id);
            } else {
                eprintln!(
                    "Deletion failed again: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
                std::process::exit(1);
            }
        }

        Commands::RollbackDelete { session_id } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let record = orchestrator
                .manager(&repo_id)?
                .rollback_deletion(&session_id)
                .await?;
            println!("Session {} restored to {}", record.session_id, record.status);
        }

        Commands::CleanupOrphan { path } => {
            let repo_id = orchestrator.resolve_repo(cli.repo.as_deref())?;
            let result = orchestrator.manager(&repo_id)?.cleanup_orphan(&path).await;
            if result.success {
                if result.not_found {
                    println!("Nothing at {} (already gone)", path.display());
                } else {
                    println!("Removed {}", path.display());
                }
            } else {
                eprintln!(
                    "Refused: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
                std::process::exit(1);
            }
        }

        Commands::Orphans => {
            let orphans = orchestrator.sweep_orphans();
            if orphans.is_empty() {
                println!("No orphan worktrees");
            } else {
                for orphan in orphans {
                    println!(
                        "  {} {} (session {})",
                        orphan.repository_id,
                        orphan.path.display(),
                        orphan.session_id.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    Ok(())
}
