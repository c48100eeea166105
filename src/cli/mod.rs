//! CLI command definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::manager::DeletionMode;
use crate::session::SessionMode;

#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Local control plane for coding agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Repository id (defaults to the sole configured repository)
    #[arg(short, long, global = true)]
    pub repo: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Spawn a worker session for an issue
    Spawn {
        /// Issue number in the repository's tracker
        issue_number: u64,

        /// How the session is driven
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Extra prompt sections appended to the worker prompt
        #[arg(long = "prompt-section")]
        prompt_sections: Vec<String>,
    },

    /// List sessions
    List {
        /// Show worktree and loop details
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show one session
    Status {
        session_id: String,
    },

    /// Pause a session
    Pause {
        session_id: String,
    },

    /// Resume a paused session
    Resume {
        session_id: String,
    },

    /// Forward a message to a running worker
    Forward {
        session_id: String,
        message: String,
    },

    /// Record a heartbeat (invoked by workers)
    Heartbeat {
        session_id: String,
    },

    /// Acknowledge a forwarded message (invoked by workers)
    Ack {
        session_id: String,
    },

    /// Re-spawn the worker for a session
    Restart {
        session_id: String,

        /// Iteration number to record for this spawn
        #[arg(long)]
        iteration: Option<u32>,
    },

    /// Delete a session and its worktree
    Delete {
        session_id: String,

        /// Continue even if worktree removal fails
        #[arg(long)]
        force: bool,

        /// What to delete beyond the session record
        #[arg(long, value_enum, default_value = "folder-only")]
        mode: DeleteModeArg,

        /// Keep the worktree on disk
        #[arg(long)]
        keep_working_copy: bool,
    },

    /// Retry a failed deletion
    RetryDelete {
        session_id: String,
    },

    /// Roll a failed deletion back to the previous status
    RollbackDelete {
        session_id: String,
    },

    /// Remove a worktree that has no session
    CleanupOrphan {
        path: PathBuf,
    },

    /// List orphan worktrees across repositories
    Orphans,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Manual,
    Autonomous,
}

impl From<ModeArg> for SessionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Manual => SessionMode::Manual,
            ModeArg::Autonomous => SessionMode::Autonomous,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DeleteModeArg {
    /// Remove only the worktree folder
    FolderOnly,
    /// Also delete the local branch
    WithLocalBranch,
    /// Also delete the remote branch
    Everything,
}

impl From<DeleteModeArg> for DeletionMode {
    fn from(mode: DeleteModeArg) -> Self {
        match mode {
            DeleteModeArg::FolderOnly => DeletionMode::FolderOnly,
            DeleteModeArg::WithLocalBranch => DeletionMode::WithLocalBranch,
            DeleteModeArg::Everything => DeletionMode::Everything,
        }
    }
}
