//! taiex - Taiwan equities sync and screening tool.
//!
//! Discovers listed symbols, backfills daily bars from the exchanges and
//! vendor APIs, and runs technical screens over the local store.

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

use taiex_common::config::{expand_path, Config};
use taiex_common::logging::init_logging_with_exclusions;
use taiex_common::Error;
use taiex_engine::data::{
    effective_end_date, refresh_names, taipei_now, MarketFilter, SymbolRegistry, SyncControl,
    Watchlist,
};
use taiex_engine::screener::{
    Criterion, CriterionKind, ReportFormat, ScreenReport, ScreenerConfig, ScreenerEngine,
};
use taiex_engine::TaiexService;

#[derive(Parser)]
#[command(name = "taiex")]
#[command(about = "Taiwan equities daily-bar sync and technical screener", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.taiex/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe codes 0000-9999 (or the given codes) against the exchange listings
    Probe {
        codes: Vec<String>,
    },
    /// Refresh names and boards from the vendor directory
    RefreshNames,
    /// Backfill daily bars for one symbol or a whole market
    Sync {
        /// twse, tpex or all
        #[arg(long, default_value = "all")]
        market: MarketFilter,
        /// Sync a single code
        #[arg(long)]
        symbol: Option<String>,
        /// Start of a one-off backfill range (requires --symbol)
        #[arg(long, requires = "symbol")]
        from: Option<NaiveDate>,
        /// End of a one-off backfill range
        #[arg(long, requires = "symbol")]
        to: Option<NaiveDate>,
    },
    /// Merge the whole-market snapshot for one date
    SyncDay {
        /// Defaults to the latest completed session
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Resolve unknown calendar dates from the reference instrument
    FillCalendar {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Compare stored bars against every source
    Verify {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Run a technical screen
    Screen(ScreenArgs),
    /// Manage the watchlist
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },
    /// Show store row counts
    Status,
}

#[derive(Args)]
struct ScreenArgs {
    /// volatility, bollinger-position, bollinger-width, bias, ma-trend, ma-cross,
    /// ma-breakthrough, volume-surge, price-gap, macd-cross, sideways,
    /// daily-rebound, period-volatility, intraday-range
    criterion: CriterionKind,
    /// twse, tpex or all
    #[arg(long, default_value = "all")]
    market: MarketFilter,
    /// Screen only watched symbols
    #[arg(long)]
    watchlist: bool,
    /// Window length: days, sideways window or rebound lookback
    #[arg(long)]
    days: Option<usize>,
    /// Percentage threshold of the criterion
    #[arg(long)]
    pct: Option<f64>,
    /// Volume surge ratio
    #[arg(long)]
    ratio: Option<f64>,
    /// Day for intraday-range
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Year for period-volatility
    #[arg(long)]
    year: Option<i32>,
    /// Month for period-volatility
    #[arg(long)]
    month: Option<u32>,
    /// Minimum volume in lots (total for period-volatility)
    #[arg(long)]
    min_volume: Option<u64>,
    /// Liquidity floor in lots for this run
    #[arg(long)]
    floor: Option<u64>,
    /// Rows to print
    #[arg(long, default_value_t = 30)]
    top: usize,
    /// Write the result to a file (relative paths land in the export dir)
    #[arg(long)]
    export: Option<PathBuf>,
    #[arg(long, default_value = "csv")]
    format: ReportFormat,
}

#[derive(Subcommand)]
enum WatchAction {
    Add { code: String },
    Remove { code: String },
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<Error>()
                .map_or(1, |err| err.exit_code());
            eprintln!("Error: {e:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::load_and_validate()?);
    };

    let mut config = Config::load_from(path).map_err(|e| Error::Config(format!("{e:#}")))?;
    config.apply_env_overrides();
    config.validate().map_err(|e| Error::Config(e.to_string()))?;
    Ok(config)
}

/// Request a cooperative stop on Ctrl-C.
fn stop_on_ctrl_c(control: SyncControl) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping after the current request...");
            control.stop();
        }
    });
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );
    info!("taiex v{}", env!("CARGO_PKG_VERSION"));

    let service = TaiexService::new(config)?;
    stop_on_ctrl_c(service.control.clone());

    match cli.command {
        Commands::Probe { codes } => {
            let prober = service.prober();
            let summary = if codes.is_empty() {
                prober.probe_all().await?
            } else {
                prober.probe_codes(codes).await?
            };
            println!("{summary}");
        }
        Commands::RefreshNames => {
            let directory = service
                .directory
                .clone()
                .ok_or_else(|| Error::Config("sources.finmind is disabled".into()))?;
            let refresh = refresh_names(directory.as_ref(), service.store.as_ref()).await?;
            println!(
                "Updated {} names ({} known-invalid codes skipped)",
                refresh.updated, refresh.skipped_invalid
            );
        }
        Commands::Sync {
            market,
            symbol,
            from,
            to,
        } => {
            let engine = service.sync_engine();
            match symbol {
                Some(code) => {
                    let symbol = service
                        .store
                        .get(&code)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("symbol {code} is not registered")))?;
                    let outcome = match (from, to) {
                        (None, None) => engine.sync_symbol(&symbol).await?,
                        (start, end) => {
                            let (default_start, default_end) = engine.default_range();
                            engine
                                .backfill(
                                    &symbol,
                                    start.unwrap_or(default_start),
                                    end.unwrap_or(default_end),
                                )
                                .await?
                        }
                    };
                    println!(
                        "{} ({}): {} inserted, {} already present, {} rejected, {}/{} windows failed, status {}",
                        symbol.code,
                        symbol.name,
                        outcome.inserted,
                        outcome.already_present,
                        outcome.rejected,
                        outcome.windows_failed,
                        outcome.windows_planned,
                        outcome.status()
                    );
                }
                None => {
                    let summary = engine.sync_all(market).await?;
                    println!("{summary}");
                }
            }
        }
        Commands::SyncDay { date } => {
            let engine = service.sync_engine();
            let date = date.unwrap_or_else(|| {
                effective_end_date(taipei_now(), service.config.sync.cutoff_hour)
            });
            let outcome = engine.sync_market_day(date).await?;
            if outcome.skipped_closed {
                println!("{date} is a known holiday, nothing to merge");
            } else {
                println!(
                    "{date}: {} rows, {} inserted, {} already present, {} rejected, {} unregistered",
                    outcome.rows,
                    outcome.inserted,
                    outcome.already_present,
                    outcome.rejected,
                    outcome.unregistered
                );
            }
        }
        Commands::FillCalendar { from, to } => {
            let fill = service.sync_engine().fill_calendar(from, to).await?;
            println!(
                "Marked {} trading days and {} holidays",
                fill.marked_trading, fill.marked_closed
            );
        }
        Commands::Verify { symbol, from, to } => {
            let symbol = service
                .store
                .get(&symbol)
                .await?
                .ok_or_else(|| Error::NotFound(format!("symbol {symbol} is not registered")))?;
            let found = service.sync_engine().verify(&symbol, from, to).await?;
            if found.is_empty() {
                println!("{}: stored bars agree with every source", symbol.code);
            }
            for d in &found {
                let stored = d
                    .stored
                    .as_ref()
                    .map(|v| format!("{:.2} / {}", v.close, v.volume))
                    .unwrap_or_else(|| "missing".to_string());
                let preferred = d
                    .preferred
                    .as_ref()
                    .map(|(source, v)| format!("{source} {:.2} / {}", v.close, v.volume))
                    .unwrap_or_default();
                println!("{}  stored {stored}  preferred {preferred}", d.date);
            }
        }
        Commands::Screen(args) => screen(&service, args).await?,
        Commands::Watch { action } => match action {
            WatchAction::Add { code } => {
                service.store.watch(&code, taipei_now().date()).await?;
                println!("Watching {code}");
            }
            WatchAction::Remove { code } => {
                if service.store.unwatch(&code).await? {
                    println!("Removed {code}");
                } else {
                    println!("{code} was not on the watchlist");
                }
            }
            WatchAction::List => {
                for watched in service.store.watched().await? {
                    let name = service
                        .store
                        .get(&watched.code)
                        .await?
                        .map(|s| s.name)
                        .unwrap_or_default();
                    println!("{}  {}  {}", watched.code, name, watched.watch_date);
                }
            }
        },
        Commands::Status => {
            let stats = service.store.get_stats().await?;
            println!("symbols:        {}", stats.symbols);
            println!("invalid codes:  {}", stats.invalid_symbols);
            println!("bars:           {}", stats.bars);
            println!(
                "calendar:       {} trading, {} closed",
                stats.trading_days, stats.closed_days
            );
            println!("watched:        {}", stats.watched);
        }
    }

    Ok(())
}

/// Apply command-line overrides on top of the criterion defaults.
fn tune(criterion: &mut Criterion, args: &ScreenArgs) -> Result<()> {
    match criterion {
        Criterion::Volatility { days, min_pct } => {
            *days = args.days.unwrap_or(*days);
            *min_pct = args.pct.unwrap_or(*min_pct);
        }
        Criterion::Bias { min_abs_pct } => *min_abs_pct = args.pct.unwrap_or(*min_abs_pct),
        Criterion::VolumeSurge { ratio } => *ratio = args.ratio.unwrap_or(*ratio),
        Criterion::PriceGap { min_pct } => *min_pct = args.pct.unwrap_or(*min_pct),
        Criterion::Sideways {
            window,
            threshold_pct,
        } => {
            *window = args.days.unwrap_or(*window);
            *threshold_pct = args.pct.unwrap_or(*threshold_pct);
        }
        Criterion::DailyRebound { lookback, min_pct } => {
            *lookback = args.days.unwrap_or(*lookback);
            *min_pct = args.pct.unwrap_or(*min_pct);
        }
        Criterion::PeriodVolatility {
            year,
            month,
            min_pct,
            min_total_volume,
        } => {
            if let Some(m) = args.month {
                if !(1..=12).contains(&m) {
                    return Err(Error::InvalidInput(format!("month {m} is not in 1-12")).into());
                }
                *month = m;
            }
            *year = args.year.unwrap_or(*year);
            *min_pct = args.pct.unwrap_or(*min_pct);
            *min_total_volume = args.min_volume.unwrap_or(*min_total_volume);
        }
        Criterion::IntradayRange {
            date,
            min_range_pct,
            min_volume,
        } => {
            *date = args.date.unwrap_or(*date);
            *min_range_pct = args.pct.unwrap_or(*min_range_pct);
            *min_volume = args.min_volume.unwrap_or(*min_volume);
        }
        Criterion::BollingerPosition
        | Criterion::BollingerWidth
        | Criterion::MaTrend
        | Criterion::MaCross
        | Criterion::MaBreakthrough
        | Criterion::MacdCross => {}
    }
    Ok(())
}

async fn screen(service: &TaiexService, args: ScreenArgs) -> Result<()> {
    let today = effective_end_date(taipei_now(), service.config.sync.cutoff_hour);
    let mut criterion = args.criterion.with_defaults(today);
    tune(&mut criterion, &args)?;

    let mut universe = service.store.list_valid(args.market).await?;
    if args.watchlist {
        let watched: Vec<String> = service
            .store
            .watched()
            .await?
            .into_iter()
            .map(|w| w.code)
            .collect();
        universe.retain(|s| watched.contains(&s.code));
    }

    let mut config = ScreenerConfig::from(&service.config.screener);
    if let Some(floor) = args.floor {
        config = config.with_floor_override(args.criterion, floor);
    }
    let market_suffix = config.market_suffix;
    let engine = ScreenerEngine::new(service.store.clone(), config);

    let outcome = engine
        .screen(&criterion, &universe, |p| {
            if p.current % 200 == 0 || p.current == p.total {
                info!(
                    current = p.current,
                    total = p.total,
                    percent = %format!("{:.1}", p.percent()),
                    "Screening"
                );
            }
        })
        .await;

    println!("{}", outcome.summary());
    for (i, hit) in outcome.top(args.top).iter().enumerate() {
        println!(
            "{:>3}. {} {:<8} {:<5} {:>10.2}  close {:>8.2}  vol {:>8}  {}",
            i + 1,
            hit.symbol.code,
            hit.symbol.name,
            hit.symbol.market,
            hit.signal.metric(),
            hit.close,
            hit.volume,
            hit.date
        );
    }

    if let Some(path) = &args.export {
        let path = if path.is_relative() {
            expand_path(&service.config.screener.export_dir).join(path)
        } else {
            path.clone()
        };
        let written = ScreenReport::new(outcome)
            .with_market_suffix(market_suffix)
            .save_to_file(&path, args.format)?;
        println!("Exported {} to {}", args.format, written.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen_args(argv: &[&str]) -> ScreenArgs {
        let mut full = vec!["taiex", "screen"];
        full.extend_from_slice(argv);
        let cli = Cli::try_parse_from(full).unwrap();
        match cli.command {
            Commands::Screen(args) => args,
            _ => unreachable!(),
        }
    }

    fn period_defaults() -> Criterion {
        CriterionKind::PeriodVolatility.with_defaults(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap())
    }

    #[test]
    fn test_tune_applies_period_overrides() {
        let args = screen_args(&["period-volatility", "--year", "2022", "--month", "2", "--pct", "15"]);
        let mut criterion = period_defaults();
        tune(&mut criterion, &args).unwrap();

        match criterion {
            Criterion::PeriodVolatility { year, month, min_pct, .. } => {
                assert_eq!((year, month), (2022, 2));
                assert_eq!(min_pct, 15.0);
            }
            other => panic!("unexpected criterion {other:?}"),
        }
    }

    #[test]
    fn test_tune_rejects_month_out_of_range() {
        for month in ["0", "13"] {
            let args = screen_args(&["period-volatility", "--month", month]);
            let mut criterion = period_defaults();
            let err = tune(&mut criterion, &args).unwrap_err();

            let err = err.downcast_ref::<Error>().unwrap();
            assert!(matches!(err, Error::InvalidInput(_)));
            assert_eq!(err.exit_code(), 64);
        }
    }
}
