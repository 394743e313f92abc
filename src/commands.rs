use std::fs;

use regstash::{Context, Error, Labels, RegistryOptions, Result, Storage};
use tracing::info;

use crate::cli;

fn options(common: &cli::CommonOptions) -> RegistryOptions {
    RegistryOptions::new(&common.user, &common.password)
        .insecure(common.insecure)
        .with_env_insecure()
}

fn labels(args: &cli::PushArguments) -> Labels {
    args.label.iter().cloned().collect()
}

/// Pushes one file under the `config` key.
pub fn handle_push(storage: &Storage, args: &cli::PushArguments) -> Result<()> {
    let content = fs::read_to_string(&args.path).map_err(|e| Error::io("Reading", &args.path, e))?;
    let digest = storage.push_config(&Context::new(), &content, &args.repo_tag, &options(&args.common), &labels(args))?;
    info!("===> Pushed {} to {}", args.path.display(), args.repo_tag);
    println!("{digest}");
    Ok(())
}

pub fn handle_pull(storage: &Storage, args: &cli::PullArguments) -> Result<()> {
    let content = storage.pull_config(&Context::new(), &args.repo_tag, &options(&args.common))?;
    print!("{content}");
    Ok(())
}

pub fn handle_push_dir(storage: &Storage, args: &cli::PushArguments) -> Result<()> {
    let digest = storage.push_directory(&Context::new(), &args.path, &args.repo_tag, &options(&args.common), &labels(args))?;
    info!("===> Pushed {} to {}", args.path.display(), args.repo_tag);
    println!("{digest}");
    Ok(())
}

pub fn handle_pull_dir(storage: &Storage, args: &cli::PullDirArguments) -> Result<()> {
    let target = storage.pull_to_directory(&Context::new(), &args.repo_tag, &args.output, &options(&args.common))?;
    println!("{}", target.display());
    Ok(())
}

pub fn handle_list(storage: &Storage, args: &cli::ListArguments) -> Result<()> {
    let repositories = storage.list_registry(&Context::new(), &args.registry, &options(&args.common))?;
    for repository in repositories {
        println!("{repository}");
    }
    Ok(())
}

pub fn handle_tags(storage: &Storage, args: &cli::TagsArguments) -> Result<()> {
    let tags = storage.list_repository(&Context::new(), &args.repository, &options(&args.common))?;
    for tag in tags {
        println!("{tag}");
    }
    Ok(())
}
