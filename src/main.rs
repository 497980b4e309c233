//! Photo Catalog CLI
//!
//! Incremental gallery scanning and catalog maintenance.

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;

use photo_catalog::config::{ScanConfigBuilder, DEFAULT_RECENT_LIMIT};
use photo_catalog::{
    CancelToken, Category, DeleteMode, FailurePolicy, ImageRecord, ScanConfig, SyncFacade,
};

const ABOUT: &str = r#"
Photo Catalog - 相册增量扫描与分类目录

使用示例:
  photo_catalog scan -r /path/to/photos             扫描单个目录
  photo_catalog scan -r /DCIM -r /Pictures          扫描多个目录
  photo_catalog scan -r /photos --progress          输出扫描进度
  photo_catalog stats                               查看分类与城市统计
  photo_catalog recent -n 10 --category food        查看最近的美食照片
  photo_catalog reclassify <id> travel              手动修改分类
  photo_catalog delete <id> --files                 删除记录和文件
  photo_catalog backfill-cities                     补全缺失的城市信息
"#;

const DEFAULT_DB: &str = "photo_catalog.db";

/// Incremental photo catalog
#[derive(Parser)]
#[command(name = "photo_catalog")]
#[command(author, version, about = ABOUT, long_about = None)]
#[command(help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// 数据库文件路径
    #[arg(short = 'd', long, global = true, help = "SQLite数据库文件路径")]
    db: Option<PathBuf>,

    /// JSON 配置文件
    #[arg(long, global = true, help = "JSON配置文件，命令行参数优先")]
    config: Option<PathBuf>,

    /// 以 JSON 格式输出结果
    #[arg(long, global = true, help = "输出JSON格式的结果")]
    json: bool,

    /// 显示帮助信息
    #[arg(short = 'h', long = "help", action = clap::ArgAction::Help, global = true)]
    help: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// 增量扫描目录中的图片
    #[command(about = "增量扫描目录中的图片")]
    Scan {
        #[arg(short = 'r', long, help = "扫描的根目录，可多次指定")]
        roots: Vec<PathBuf>,

        #[arg(short = 't', long, help = "每批并行线程数，0表示自动检测")]
        threads: Option<usize>,

        #[arg(long, help = "并行处理通道数")]
        lanes: Option<usize>,

        #[arg(short = 'b', long, help = "每批处理并写入数据库的图片数")]
        batch_size: Option<usize>,

        #[arg(long, help = "不递归扫描子目录")]
        no_recursive: bool,

        #[arg(long, help = "递归扫描的最大深度")]
        max_depth: Option<usize>,

        #[arg(long, help = "分类失败的图片不入库，下次扫描重试")]
        skip_failed: bool,

        #[arg(long, help = "城市数据JSON文件")]
        cities: Option<PathBuf>,

        #[arg(long, help = "向stderr输出JSON格式的进度")]
        progress: bool,
    },

    /// 查看分类与城市统计
    #[command(about = "查看分类与城市统计")]
    Stats,

    /// 查看最近的图片
    #[command(about = "查看最近的图片")]
    Recent {
        #[arg(short = 'n', long, default_value_t = DEFAULT_RECENT_LIMIT, help = "显示数量")]
        limit: usize,

        #[arg(long, conflicts_with = "city", help = "只看某个分类")]
        category: Option<String>,

        #[arg(long, help = "只看某个城市")]
        city: Option<String>,
    },

    /// 手动修改图片分类
    #[command(about = "手动修改图片分类")]
    Reclassify {
        id: String,
        category: String,
    },

    /// 删除图片记录
    #[command(about = "删除图片记录")]
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,

        #[arg(long, help = "同时删除磁盘上的文件")]
        files: bool,
    },

    /// 为有GPS但没有城市的图片补全城市信息
    #[command(about = "补全缺失的城市信息")]
    BackfillCities,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("{}", ABOUT);
        println!("使用 'photo_catalog scan -h' 查看扫描命令的详细帮助");
        println!("使用 'photo_catalog --help' 查看完整帮助信息");
        return;
    };

    let mut builder = match &cli.config {
        Some(path) => match ScanConfig::from_json_file(path) {
            Ok(config) => ScanConfigBuilder::from_config(config),
            Err(e) => fail(e),
        },
        None => ScanConfig::builder(),
    };
    if let Some(db) = cli.db.clone() {
        builder = builder.db_path(db);
    }

    match command {
        Commands::Scan {
            roots,
            threads,
            lanes,
            batch_size,
            no_recursive,
            max_depth,
            skip_failed,
            cities,
            progress,
        } => {
            if !roots.is_empty() {
                builder = builder.roots(roots);
            }
            if let Some(threads) = threads {
                builder = builder.num_threads(threads);
            }
            if let Some(lanes) = lanes {
                builder = builder.lanes(lanes);
            }
            if let Some(size) = batch_size {
                builder = builder.batch_size(size);
            }
            if no_recursive {
                builder = builder.recursive(false);
            }
            if let Some(depth) = max_depth {
                builder = builder.max_depth(depth);
            }
            if skip_failed {
                builder = builder.failure_policy(FailurePolicy::Skip);
            }
            if let Some(path) = cities {
                builder = builder.cities_path(path);
            }

            let facade = open(builder);
            let config = facade.config();
            if config.roots.is_empty() {
                fail("没有指定扫描目录，请使用 -r 或配置文件中的 roots");
            }
            info!("Roots: {:?}", config.roots);
            info!(
                "Threads: {}",
                if config.num_threads == 0 {
                    "auto".to_string()
                } else {
                    config.num_threads.to_string()
                }
            );
            info!("Lanes: {}", config.effective_lanes());
            info!("Batch size: {}", config.effective_batch_size());
            info!("Recursive: {}", config.recursive);

            let result = if progress {
                let (rx, handle) = facade.spawn_scan(CancelToken::new());
                for update in rx.iter() {
                    update.print_to_stderr();
                }
                match handle.join() {
                    Ok(result) => result,
                    Err(_) => fail("扫描线程异常退出"),
                }
            } else {
                facade.scan_with_progress(None, &CancelToken::new())
            };
            let summary = result.unwrap_or_else(|e| fail(e));

            if cli.json {
                print_json(&summary);
            } else {
                println!("Scan completed:");
                println!("  Files found: {}", summary.files_found);
                println!("  Added: {}", summary.added);
                println!("  Removed: {}", summary.removed);
                println!("  Failed: {}", summary.failed);
                println!("  Duration: {}ms", summary.duration_ms);
            }
        }
        Commands::Stats => {
            let facade = open(builder);
            let categories = facade.category_counts().unwrap_or_else(|e| fail(e));
            let cities = facade.city_counts().unwrap_or_else(|e| fail(e));
            let last_scan = facade.last_scan_time().unwrap_or_else(|e| fail(e));
            let status = facade.status();

            if cli.json {
                print_json(&serde_json::json!({
                    "categories": categories,
                    "cities": cities,
                    "last_scan_time": last_scan,
                    "cache": status,
                }));
            } else {
                println!("Images: {}", status.records);
                match last_scan {
                    Some(time) => println!("Last scan: {}", time.to_rfc3339()),
                    None => println!("Last scan: never"),
                }
                println!("Categories:");
                for (category, count) in &categories {
                    println!("  {:<10} {:<8} {}", category.as_str(), category.display_name(), count);
                }
                println!("Cities:");
                for (city, count) in &cities {
                    println!("  {:<10} {}", city, count);
                }
            }
        }
        Commands::Recent {
            limit,
            category,
            city,
        } => {
            let facade = open(builder);
            let records = match (category, city) {
                (Some(label), _) => {
                    let category = parse_category(&label);
                    facade.recent_by_category(category, limit)
                }
                (None, Some(city)) => facade.recent_by_city(&city, limit),
                (None, None) => facade.recent_images(limit),
            }
            .unwrap_or_else(|e| fail(e));
            print_records(&records, cli.json);
        }
        Commands::Reclassify { id, category } => {
            let facade = open(builder);
            let category = parse_category(&category);
            let record = facade
                .write_classification(&id, category)
                .unwrap_or_else(|e| fail(e));
            if cli.json {
                print_json(&record);
            } else {
                println!("{} -> {}", record.file_name, category.display_name());
            }
        }
        Commands::Delete { ids, files } => {
            let facade = open(builder);
            let mode = if files {
                DeleteMode::RecordAndFile
            } else {
                DeleteMode::RecordOnly
            };
            let outcome = facade.write_deletes(&ids, mode).unwrap_or_else(|e| fail(e));
            if cli.json {
                print_json(&outcome);
            } else {
                println!("Records removed: {}", outcome.records_removed);
                if files {
                    println!("  Files deleted: {}", outcome.files_deleted);
                    println!("  Files skipped: {}", outcome.files_skipped);
                    println!("  Files failed: {}", outcome.files_failed);
                }
            }
        }
        Commands::BackfillCities => {
            let facade = open(builder);
            let outcome = facade.backfill_city_info().unwrap_or_else(|e| fail(e));
            if cli.json {
                print_json(&outcome);
            } else {
                println!("Cities filled: {}", outcome.updated);
                println!("  No nearby city: {}", outcome.skipped);
            }
        }
    }
}

fn open(builder: ScanConfigBuilder) -> SyncFacade {
    let mut config = builder.build();
    if config.db_path.is_none() {
        config.db_path = Some(PathBuf::from(DEFAULT_DB));
    }
    SyncFacade::open(config).unwrap_or_else(|e| fail(e))
}

fn parse_category(label: &str) -> Category {
    Category::parse(label).unwrap_or_else(|| {
        let known: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
        fail(format!("未知分类 '{}'，可选: {}", label, known.join(", ")))
    })
}

fn print_records(records: &[ImageRecord], json: bool) {
    if json {
        print_json(&records);
        return;
    }
    for record in records {
        println!(
            "{}  {:<8}  {:<6}  {}",
            record.id,
            record.effective_category().as_str(),
            record.city().unwrap_or("-"),
            record.file_name
        );
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(e),
    }
}

fn fail(err: impl Display) -> ! {
    eprintln!("Error: {}", err);
    std::process::exit(1)
}
