//! resilience-check: 弹性配置校验与查看工具
//!
//! Usage:
//!   resilience-check validate <config>                  Validate a config file
//!   resilience-check show <config>                      Print resolved limits, breakers and chains
//!   resilience-check keys <config> <provider> [--caller ID] [--agent ID] [--workspace ID] [--op TAG]
//!                                                       Show which limiter keys a request would hit

use ai_lib_resilience::{RequestContext, ResilienceConfig};
use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "validate" => cmd_validate(&args[2..]),
        "show" => cmd_show(&args[2..]),
        "keys" => cmd_keys(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("resilience-check {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"resilience-check: 弹性配置工具

USAGE:
    resilience-check <COMMAND> [ARGS]

COMMANDS:
    validate <config>            Load, apply AI_RESILIENCE_* overrides and validate
    show <config>                Print the resolved configuration as YAML
    keys <config> <provider>     List limiter keys for a request and whether each is limited
        --caller <id>  --agent <id>  --workspace <id>  --op <tag>
    version                      Print version
    help                         Show this message

Set RUST_LOG=ai_lib_resilience=debug for diagnostics."#
    );
}

fn load(args: &[String]) -> Result<ResilienceConfig> {
    let Some(path) = args.first() else {
        bail!("missing <config> argument");
    };
    ResilienceConfig::load(path).with_context(|| format!("loading {}", path))
}

fn cmd_validate(args: &[String]) -> Result<()> {
    let cfg = load(args)?;
    println!(
        "ok: {} limiter scopes, {} key overrides, {} breaker overrides, {} chains",
        cfg.limiter.scopes.len(),
        cfg.limiter.overrides.len(),
        cfg.circuit_breaker.targets.len(),
        usize::from(!cfg.chains.default.is_empty())
            + cfg.chains.agents.len()
            + cfg.chains.callers.len(),
    );
    Ok(())
}

fn cmd_show(args: &[String]) -> Result<()> {
    let cfg = load(args)?;
    print!("{}", serde_yaml::to_string(&cfg)?);
    Ok(())
}

fn cmd_keys(args: &[String]) -> Result<()> {
    let cfg = load(args)?;
    let Some(provider) = args.get(1) else {
        bail!("missing <provider> argument");
    };
    let mut ctx = RequestContext::new();
    let mut rest = args[2..].iter();
    while let Some(flag) = rest.next() {
        let value = rest
            .next()
            .with_context(|| format!("{} needs a value", flag))?;
        ctx = match flag.as_str() {
            "--caller" => ctx.with_caller(value),
            "--agent" => ctx.with_agent(value),
            "--workspace" => ctx.with_workspace(value),
            "--op" => ctx.with_operation(value),
            other => bail!("unknown flag {}", other),
        };
    }

    if cfg.limiter.is_exempt(ctx.operation.as_deref()) {
        println!("operation is exempt from admission control");
        return Ok(());
    }
    for key in ctx.limit_keys(provider) {
        match cfg.limiter.limit_for(&key) {
            Some(l) => println!(
                "{:<32} burst={} refill={}/{}ms window={}/{}ms queue={}",
                key,
                l.max_burst,
                l.tokens_per_interval,
                l.interval_ms,
                l.max_requests_per_window,
                l.window_ms,
                l.max_queue_size
            ),
            None => println!("{:<32} unlimited", key),
        }
    }
    Ok(())
}
