use std::process::ExitCode;

use clap::Args;

use super::ConfigArgs;
use crate::config;
use crate::error::{RunnerError, RunnerResult};
use crate::paths::RunnerPaths;
use crate::workspace::{self, WorkspaceCache};

#[derive(Args)]
pub struct ListArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

/// Print cached workspaces sorted by project name, with their sizes.
pub async fn run_list(args: ListArgs) -> RunnerResult<ExitCode> {
    let config = config::load(&args.config.config).await?;
    let cache = WorkspaceCache::new(RunnerPaths::new(config.base_dir).workspaces());
    let root = cache.root().to_path_buf();

    let rows = tokio::task::spawn_blocking(move || -> RunnerResult<Vec<String>> {
        let rows = cache
            .list_all()?
            .into_iter()
            .map(|ws| {
                format!(
                    "{}\t{}\t{}\t{}",
                    ws.info.project_name(),
                    workspace::format_size(workspace::size_of(&ws.dir)),
                    ws.info.project_path.join(&ws.info.build_dir).display(),
                    ws.dir.display(),
                )
            })
            .collect();
        Ok(rows)
    })
    .await
    .map_err(|e| RunnerError::Internal(format!("list task: {e}")))??;

    if rows.is_empty() {
        eprintln!("no cached workspaces in {}", root.display());
    }
    for row in rows {
        println!("{row}");
    }
    Ok(ExitCode::SUCCESS)
}
