use std::io::Write;

use anyhow::{Result, bail};
use argp::FromArgs;
use terrapin_core::locking::LockBackend;
use time::format_description::well_known::Rfc3339;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Inspect and release project locks.
#[argp(subcommand, name = "locks")]
pub struct Args {
    #[argp(subcommand)]
    command: LocksCommand,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
#[argp(subcommand)]
enum LocksCommand {
    List(ListArgs),
    Unlock(UnlockArgs),
    UnlockPull(UnlockPullArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// List every held lock.
#[argp(subcommand, name = "list")]
struct ListArgs {
    #[argp(switch)]
    /// print JSON instead of a table
    json: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Release a lock and delete its plan.
#[argp(subcommand, name = "unlock")]
struct UnlockArgs {
    #[argp(positional)]
    /// lock id, e.g. owner/repo/path/workspace
    id: String,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Release every lock held by a pull request.
#[argp(subcommand, name = "unlock-pull")]
struct UnlockPullArgs {
    #[argp(positional)]
    /// repository full name, e.g. owner/repo
    repo: String,
    #[argp(positional)]
    /// pull request number
    num: u64,
}

pub async fn run(args: Args, backend: &dyn LockBackend, out: &mut impl Write) -> Result<()> {
    match args.command {
        LocksCommand::List(ListArgs { json }) => {
            let locks = backend.list().await?;
            if json {
                serde_json::to_writer_pretty(&mut *out, &locks)?;
                writeln!(out)?;
                return Ok(());
            }
            if locks.is_empty() {
                writeln!(out, "No locks held")?;
            }
            for lock in locks {
                let created_at = lock.created_at.format(&Rfc3339)?;
                writeln!(
                    out,
                    "{}\tpull #{}\t{}\t{created_at}",
                    lock.id(),
                    lock.pull.num,
                    lock.user.username
                )?;
            }
        }
        LocksCommand::Unlock(UnlockArgs { id }) => match backend.unlock(&id).await? {
            Some(lock) => writeln!(out, "Released {id} held by pull #{}", lock.pull.num)?,
            None => bail!("No lock found with id {id}"),
        },
        LocksCommand::UnlockPull(UnlockPullArgs { repo, num }) => {
            let locks = backend.unlock_by_pull(&repo, num).await?;
            for lock in &locks {
                writeln!(out, "Released {}", lock.id())?;
            }
            tracing::info!("Released {} locks of {repo}#{num}", locks.len());
            writeln!(out, "{} locks released", locks.len())?;
        }
    }
    Ok(())
}
