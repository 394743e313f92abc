use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version)]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub(crate) mode: Mode,
}

impl Cli {
    pub(crate) const fn common(&self) -> &CommonOptions {
        match &self.mode {
            Mode::Push(args) | Mode::PushDir(args) => &args.common,
            Mode::Pull(args) => &args.common,
            Mode::PullDir(args) => &args.common,
            Mode::List(args) => &args.common,
            Mode::Tags(args) => &args.common,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Mode {
    /// Push a single file, stored under the `config` key.
    Push(PushArguments),

    /// Pull the file stored under the `config` key and print it.
    Pull(PullArguments),

    /// Push every regular file directly inside a directory.
    #[command(name = "push-dir")]
    PushDir(PushArguments),

    /// Pull all files into a new directory named after the repository.
    #[command(name = "pull-dir")]
    PullDir(PullDirArguments),

    /// List the repositories of a registry.
    #[command(alias = "ls")]
    List(ListArguments),

    /// List the tags of a repository.
    Tags(TagsArguments),
}

#[derive(Args, Debug, Clone)]
pub struct PushArguments {
    #[arg(value_name = "PATH", help = "File to push, or directory for push-dir.")]
    pub(crate) path: PathBuf,

    #[arg(value_name = "REPOTAG", help = "Target reference, e.g. ghcr.io/team/app:1.0")]
    pub(crate) repo_tag: String,

    /// Only stored when the registry needs the image fallback.
    #[arg(long, short, help = "Image label as key=value, can be repeated.", value_parser = parse_label)]
    pub(crate) label: Vec<(String, String)>,

    #[command(flatten)]
    pub(crate) common: CommonOptions,
}

#[derive(Args, Debug, Clone)]
pub struct PullArguments {
    #[arg(value_name = "REPOTAG", help = "Reference to pull, e.g. ghcr.io/team/app:1.0")]
    pub(crate) repo_tag: String,

    #[command(flatten)]
    pub(crate) common: CommonOptions,
}

#[derive(Args, Debug, Clone)]
pub struct PullDirArguments {
    #[arg(value_name = "REPOTAG", help = "Reference to pull, e.g. ghcr.io/team/app:1.0")]
    pub(crate) repo_tag: String,

    #[arg(long, short, help = "Directory the new directory is created in.", default_value = ".")]
    pub(crate) output: PathBuf,

    #[command(flatten)]
    pub(crate) common: CommonOptions,
}

#[derive(Args, Debug, Clone)]
pub struct ListArguments {
    #[arg(value_name = "REGISTRY", help = "Registry endpoint, e.g. localhost:5000")]
    pub(crate) registry: String,

    #[command(flatten)]
    pub(crate) common: CommonOptions,
}

#[derive(Args, Debug, Clone)]
pub struct TagsArguments {
    #[arg(value_name = "REPOSITORY", help = "Repository, e.g. ghcr.io/team/app")]
    pub(crate) repository: String,

    #[command(flatten)]
    pub(crate) common: CommonOptions,
}

#[derive(Args, Debug, Clone)]
pub struct CommonOptions {
    #[arg(long, short, help = "Registry username, defaults to the docker credential store.", default_value = "")]
    pub(crate) user: String,

    #[arg(long, short, help = "Registry password.", default_value = "", hide_default_value = true)]
    pub(crate) password: String,

    #[arg(long, help = "Skip TLS certificate verification.")]
    pub(crate) insecure: bool,

    #[arg(long, short, help = "Activates debug logging.")]
    pub(crate) debug: bool,

    #[arg(long, short, help = "Only print results, no logging.")]
    pub(crate) quiet: bool,
}

fn parse_label(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, label)) if !key.is_empty() => Ok((key.to_owned(), label.to_owned())),
        _ => Err(format!("`{value}` is not of the form key=value")),
    }
}
