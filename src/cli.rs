use crate::{
    analysis::analyze,
    archive_tool::{ArchiveTool, RepakTool},
    classifier::{Classification, ConflictCategory, ConflictEntry},
    config::{base_data_dir, default_config_path, AppConfig},
    content_tree::{normalize_logical_path, SourceArchive},
    error::RunAbort,
    executor::TaskRetryExecutor,
    logging,
    merge_tool::{ExternalMergeTool, MergeToolKind},
    processor::{ConflictProcessor, ProcessorOptions},
    prompt::{DestinationPrompt, FixedDestination, LinePrompt},
    reference::extract_reference,
    report::{
        render_abort, render_analysis, render_config, render_extraction, render_run, OutputFormat,
    },
    session::SessionDir,
};
use anyhow::{bail, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{error, info, warn};

#[derive(Debug)]
struct GlobalOptions {
    format: OutputFormat,
    config: Option<PathBuf>,
    verbose: bool,
}

#[derive(Debug)]
enum CliCommand {
    Analyze(AnalyzeOptions),
    Merge(MergeOptions),
    UnpackVanilla(Vec<PathBuf>),
    Config,
    Help,
    Version,
}

#[derive(Debug, Default)]
struct AnalyzeOptions {
    paks: Vec<PathBuf>,
    search: Option<String>,
    category: Option<ConflictCategory>,
    vanilla: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct MergeOptions {
    paks: Vec<PathBuf>,
    only: Vec<String>,
    categories: Vec<ConflictCategory>,
    include_no_conflict: bool,
    merge_tool: Option<MergeToolKind>,
    dest: Option<PathBuf>,
    vanilla: Option<PathBuf>,
    name: Option<String>,
    keep_temp: bool,
}

pub fn run() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, command) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            return Ok(ExitCode::SUCCESS);
        }
        CliCommand::Version => {
            println!("pakmerger v{}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let data_dir = base_data_dir().ok();
    logging::init(data_dir.as_deref(), global.verbose);
    let (config, config_path) = load_config(global.config.as_deref())?;

    match command {
        CliCommand::Analyze(options) => analyze_command(&config, options, global.format),
        CliCommand::Merge(options) => merge_command(&config, options, global.format),
        CliCommand::UnpackVanilla(paks) => unpack_vanilla_command(&config, paks, global.format),
        CliCommand::Config => {
            emit(&render_config(&config, &config_path, global.format)?);
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Help | CliCommand::Version => Ok(ExitCode::SUCCESS),
    }
}

fn parse_args(args: &[String]) -> Result<(GlobalOptions, CliCommand)> {
    let (global, tokens) = parse_global_options(args)?;
    let Some(head) = tokens.first() else {
        return Ok((global, CliCommand::Help));
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    let command = match head.as_str() {
        "analyze" => CliCommand::Analyze(parse_analyze(rest)?),
        "merge" => CliCommand::Merge(parse_merge(rest)?),
        "unpack-vanilla" => {
            let paks = rest
                .iter()
                .map(|arg| {
                    if arg.starts_with('-') {
                        bail!("Unknown option for unpack-vanilla: {arg}");
                    }
                    Ok(PathBuf::from(arg))
                })
                .collect::<Result<Vec<_>>>()?;
            CliCommand::UnpackVanilla(paks)
        }
        "config" => CliCommand::Config,
        "help" | "--help" | "-h" => CliCommand::Help,
        "version" | "--version" | "-V" => CliCommand::Version,
        other => bail!("Unknown command: {other} (see 'pakmerger help')"),
    };
    Ok((global, command))
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut format = OutputFormat::Text;
    let mut config = None;
    let mut verbose = false;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            format = parse_format(value)?;
            continue;
        }
        if arg == "--format" {
            let value = iter
                .next()
                .ok_or_else(|| anyhow::anyhow!("--format requires a value"))?;
            format = parse_format(value)?;
            continue;
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(value));
            continue;
        }
        if arg == "--config" {
            let value = iter
                .next()
                .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
            config = Some(PathBuf::from(value));
            continue;
        }
        if arg == "-v" || arg == "--verbose" {
            verbose = true;
            continue;
        }
        tokens.push(arg.to_string());
    }

    Ok((
        GlobalOptions {
            format,
            config,
            verbose,
        },
        tokens,
    ))
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    OutputFormat::parse(value)
        .ok_or_else(|| anyhow::anyhow!("Unknown format: {value} (use 'text' or 'json')"))
}

fn parse_analyze(args: &[String]) -> Result<AnalyzeOptions> {
    let mut options = AnalyzeOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--search" => options.search = Some(take_value(&mut iter, "--search")?),
            value if value.starts_with("--search=") => {
                options.search = Some(value.trim_start_matches("--search=").to_string());
            }
            "--category" => {
                options.category = Some(parse_category(&take_value(&mut iter, "--category")?)?);
            }
            value if value.starts_with("--category=") => {
                options.category = Some(parse_category(value.trim_start_matches("--category="))?);
            }
            "--vanilla" => options.vanilla = Some(take_value(&mut iter, "--vanilla")?.into()),
            value if value.starts_with("--vanilla=") => {
                options.vanilla = Some(PathBuf::from(value.trim_start_matches("--vanilla=")));
            }
            value if value.starts_with('-') => bail!("Unknown option for analyze: {value}"),
            value => options.paks.push(PathBuf::from(value)),
        }
    }
    if options.paks.is_empty() {
        bail!("analyze requires one or more .pak files");
    }
    Ok(options)
}

fn parse_merge(args: &[String]) -> Result<MergeOptions> {
    let mut options = MergeOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--only" => options.only.push(take_value(&mut iter, "--only")?),
            value if value.starts_with("--only=") => {
                options.only.push(value.trim_start_matches("--only=").to_string());
            }
            "--category" => {
                let value = take_value(&mut iter, "--category")?;
                options.categories.push(parse_category(&value)?);
            }
            value if value.starts_with("--category=") => {
                let value = value.trim_start_matches("--category=");
                options.categories.push(parse_category(value)?);
            }
            "--merge-tool" => {
                let value = take_value(&mut iter, "--merge-tool")?;
                options.merge_tool = Some(parse_merge_tool(&value)?);
            }
            value if value.starts_with("--merge-tool=") => {
                let value = value.trim_start_matches("--merge-tool=");
                options.merge_tool = Some(parse_merge_tool(value)?);
            }
            "--include-no-conflict" => options.include_no_conflict = true,
            "--keep-temp" => options.keep_temp = true,
            "--dest" => options.dest = Some(take_value(&mut iter, "--dest")?.into()),
            value if value.starts_with("--dest=") => {
                options.dest = Some(PathBuf::from(value.trim_start_matches("--dest=")));
            }
            "--vanilla" => options.vanilla = Some(take_value(&mut iter, "--vanilla")?.into()),
            value if value.starts_with("--vanilla=") => {
                options.vanilla = Some(PathBuf::from(value.trim_start_matches("--vanilla=")));
            }
            "--name" => options.name = Some(take_value(&mut iter, "--name")?),
            value if value.starts_with("--name=") => {
                options.name = Some(value.trim_start_matches("--name=").to_string());
            }
            value if value.starts_with('-') => bail!("Unknown option for merge: {value}"),
            value => options.paks.push(PathBuf::from(value)),
        }
    }
    if options.paks.is_empty() {
        bail!("merge requires one or more .pak files");
    }
    Ok(options)
}

fn parse_category(value: &str) -> Result<ConflictCategory> {
    ConflictCategory::parse(value).ok_or_else(|| {
        let known: Vec<&str> = ConflictCategory::ALL.iter().map(|c| c.tag()).collect();
        anyhow::anyhow!("Unknown category: {value} (use one of {})", known.join(", "))
    })
}

fn parse_merge_tool(value: &str) -> Result<MergeToolKind> {
    MergeToolKind::parse(value)
        .ok_or_else(|| anyhow::anyhow!("Unknown merge tool: {value} (use kdiff3, winmerge or meld)"))
}

fn take_value<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<String> {
    iter.next()
        .map(|value| value.to_string())
        .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
}

fn load_config(path: Option<&Path>) -> Result<(AppConfig, PathBuf)> {
    match path {
        Some(path) => {
            let config = AppConfig::load_from(path)?;
            Ok((config, path.to_path_buf()))
        }
        None => {
            let config = AppConfig::load_or_create()?;
            Ok((config, default_config_path()?))
        }
    }
}

/// Input archives as absolute paths, in the order given.
fn source_archives(paks: &[PathBuf]) -> Result<Vec<SourceArchive>> {
    paks.iter()
        .map(|pak| {
            if !pak.is_file() {
                bail!("Archive not found: {}", pak.display());
            }
            let path = fs::canonicalize(pak)
                .with_context(|| format!("resolve {}", pak.display()))?;
            Ok(SourceArchive::new(path))
        })
        .collect()
}

fn analyze_command(
    config: &AppConfig,
    options: AnalyzeOptions,
    format: OutputFormat,
) -> Result<ExitCode> {
    let tool = RepakTool::new(config.archive_tool.clone());
    tool.validate().context("archive tool unavailable")?;
    let executor = TaskRetryExecutor::from_settings(&config.tasks);
    let archives = source_archives(&options.paks)?;
    let reference_root = options.vanilla.as_deref().or(config.vanilla_root.as_deref());

    let analysis = analyze(
        &tool,
        &executor,
        &archives,
        config.aes_key.as_deref(),
        reference_root,
    );
    let mut classification = match options.search.as_deref() {
        Some(query) => analysis.search(query, reference_root),
        None => analysis.classification.clone(),
    };
    if let Some(category) = options.category {
        classification.entries = classification.of_category(category).cloned().collect();
    }

    emit(&render_analysis(&classification, &analysis.listing_failures, format)?);
    Ok(ExitCode::SUCCESS)
}

fn merge_command(
    config: &AppConfig,
    options: MergeOptions,
    format: OutputFormat,
) -> Result<ExitCode> {
    let archive_tool = RepakTool::new(config.archive_tool.clone());
    if let Err(err) = archive_tool.validate() {
        return report_abort(&RunAbort::ToolUnavailable(err.to_string()), format);
    }
    let merge_tool = match options.merge_tool {
        Some(kind) if kind != config.merge_tool => ExternalMergeTool::new(kind, None),
        _ => ExternalMergeTool::new(config.merge_tool, config.merge_tool_path.clone()),
    };
    if !merge_tool.is_available() {
        warn!(
            "{} not found, every merge will be skipped",
            merge_tool.kind().display_name()
        );
    }

    let executor = TaskRetryExecutor::from_settings(&config.tasks);
    let archives = source_archives(&options.paks)?;
    let reference_root = options.vanilla.as_deref().or(config.vanilla_root.as_deref());
    let analysis = analyze(
        &archive_tool,
        &executor,
        &archives,
        config.aes_key.as_deref(),
        reference_root,
    );
    for failure in &analysis.listing_failures {
        warn!("{} left out of the merge: {}", failure.archive, failure.reason);
    }
    let entries = select_entries(&analysis.classification, &options.only, &options.categories)?;

    let mut processor_options = ProcessorOptions::from_config(config);
    if options.include_no_conflict {
        processor_options.ignore_no_conflict = false;
    }
    if options.name.is_some() {
        processor_options.output_name = options.name;
    }

    let mut session = SessionDir::create(&base_data_dir()?.join("tmp"))?;
    if options.keep_temp {
        session.keep();
        info!("keeping session dir {}", session.root().display());
    }
    let mut prompt: Box<dyn DestinationPrompt> = match options.dest {
        Some(dest) => Box::new(FixedDestination(dest)),
        None => Box::new(LinePrompt::stdio()),
    };

    let mut processor = ConflictProcessor::new(
        &archive_tool,
        &merge_tool,
        &executor,
        &session,
        reference_root,
        processor_options,
    );
    match processor.run(&entries, prompt.as_mut()) {
        Ok(report) => {
            let report = report.with_listing_failures(analysis.listing_failures);
            emit(&render_run(&report, format)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(abort) => report_abort(&abort, format),
    }
}

fn report_abort(abort: &RunAbort, format: OutputFormat) -> Result<ExitCode> {
    if abort.is_error() {
        error!("run aborted: {abort}");
    } else {
        info!("run cancelled");
    }
    emit(&render_abort(abort, format)?);
    Ok(if abort.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Every classified entry, or the ones named by `--only` plus those in a
/// `--category`, in classification order.
fn select_entries(
    classification: &Classification,
    only: &[String],
    categories: &[ConflictCategory],
) -> Result<Vec<ConflictEntry>> {
    if only.is_empty() && categories.is_empty() {
        return Ok(classification.entries.clone());
    }
    let mut wanted = Vec::new();
    for path in only {
        let path = normalize_logical_path(path);
        if classification.find(&path).is_none() {
            bail!("No input archive contains {path}");
        }
        wanted.push(path);
    }
    Ok(classification
        .entries
        .iter()
        .filter(|entry| {
            categories.contains(&entry.category) || wanted.contains(&entry.logical_path)
        })
        .cloned()
        .collect())
}

fn unpack_vanilla_command(
    config: &AppConfig,
    paks: Vec<PathBuf>,
    format: OutputFormat,
) -> Result<ExitCode> {
    let Some(reference_root) = config.vanilla_root.as_deref() else {
        bail!("vanilla_root is not configured");
    };
    let paks = if paks.is_empty() {
        config.vanilla_paks.clone()
    } else {
        paks
    };
    if paks.is_empty() {
        bail!("No vanilla archives given or configured (vanilla_paks)");
    }

    let tool = RepakTool::new(config.archive_tool.clone());
    let executor = TaskRetryExecutor::from_settings(&config.tasks);
    let archives = source_archives(&paks)?;
    let outcome = extract_reference(
        &tool,
        &executor,
        &archives,
        reference_root,
        config.aes_key.as_deref(),
        &config.allowed_extensions,
    )?;

    emit(&render_extraction(&outcome, reference_root, format)?);
    Ok(if outcome.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn emit(output: &str) {
    if output.ends_with('\n') {
        print!("{output}");
    } else {
        println!("{output}");
    }
}

fn print_help() {
    println!("pakmerger v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  pakmerger analyze <pak>...            Classify files shared between mod archives");
    println!("  pakmerger merge <pak>...              Merge conflicts and pack the result");
    println!("  pakmerger unpack-vanilla [<pak>...]   Extract vanilla archives into vanilla_root");
    println!("  pakmerger config                      Show the effective configuration");
    println!();
    println!("Global options:");
    println!("  --format <json|text>                  Output format");
    println!("  --config <file>                       Use this config file");
    println!("  -v, --verbose                         Debug logging");
    println!("  -h, --help                            Show help");
    println!("  -V, --version                         Show version");
    println!();
    println!("Analyze options:");
    println!("  --search <text>                       Only paths containing <text>");
    println!("  --category <tag>                      Only entries of this category");
    println!("  --vanilla <dir>                       Reference root (overrides vanilla_root)");
    println!();
    println!("Merge options:");
    println!("  --only <path>                         Merge only this entry (repeatable)");
    println!("  --category <tag>                      Merge every entry of this category (repeatable)");
    println!("  --merge-tool <kdiff3|winmerge|meld>   Override the configured merge tool");
    println!("  --include-no-conflict                 Also open single-source files");
    println!("  --dest <dir>                          Output directory (prompted otherwise)");
    println!("  --vanilla <dir>                       Reference root (overrides vanilla_root)");
    println!("  --name <file>                         Output archive name");
    println!("  --keep-temp                           Keep the session directory");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classifier::classify, content_tree::ContentTree};

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn global_options_anywhere() {
        let (global, command) =
            parse_args(&args(&["analyze", "a.pak", "--format", "json", "-v", "b.pak"])).unwrap();
        assert_eq!(global.format, OutputFormat::Json);
        assert!(global.verbose);
        match command {
            CliCommand::Analyze(options) => {
                assert_eq!(options.paks, vec![PathBuf::from("a.pak"), PathBuf::from("b.pak")]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn merge_flags() {
        let (global, command) = parse_args(&args(&[
            "--config=/etc/pm.json",
            "merge",
            "a.pak",
            "b.pak",
            "--only",
            "x/y.cfg",
            "--only=z.cfg",
            "--include-no-conflict",
            "--dest",
            "/out",
            "--name=merged_P",
        ]))
        .unwrap();
        assert_eq!(global.config, Some(PathBuf::from("/etc/pm.json")));
        let CliCommand::Merge(options) = command else {
            panic!("expected merge");
        };
        assert_eq!(options.paks.len(), 2);
        assert_eq!(options.only, vec!["x/y.cfg", "z.cfg"]);
        assert!(options.include_no_conflict);
        assert_eq!(options.dest, Some(PathBuf::from("/out")));
        assert_eq!(options.name.as_deref(), Some("merged_P"));
        assert!(options.vanilla.is_none());
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(parse_args(&args(&["merge"])).is_err());
        assert!(parse_args(&args(&["analyze", "a.pak", "--bogus"])).is_err());
        assert!(parse_args(&args(&["--format", "xml", "config"])).is_err());
        assert!(parse_args(&args(&["explode"])).is_err());
        assert!(matches!(parse_args(&args(&[])).unwrap().1, CliCommand::Help));
    }

    #[test]
    fn only_selects_by_normalized_path() {
        let tree = ContentTree::build(vec![
            (SourceArchive::new("/m/a.pak"), vec!["Stalker2/Content/X.cfg", "solo.cfg"]),
            (SourceArchive::new("/m/b.pak"), vec!["Stalker2/Content/X.cfg"]),
        ]);
        let classification = classify(&tree, None);

        assert_eq!(select_entries(&classification, &[], &[]).unwrap().len(), 2);
        let picked = select_entries(
            &classification,
            &["Stalker2\\Content\\X.cfg".to_string()],
            &[],
        )
        .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].logical_path, "Stalker2/Content/X.cfg");
        assert!(select_entries(&classification, &["missing.cfg".to_string()], &[]).is_err());

        let by_category =
            select_entries(&classification, &[], &[ConflictCategory::NoConflict]).unwrap();
        assert_eq!(by_category.len(), 1);
        assert_eq!(by_category[0].logical_path, "solo.cfg");
    }
}
