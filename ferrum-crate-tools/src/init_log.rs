use std::io::Write;

/// 带颜色、时间戳和源码位置的日志格式
///
/// 形如：`[12:03:44] WARN [cmd_allocator.rs:120] command list ring exhausted`
fn format_record(buf: &mut env_logger::fmt::Formatter, record: &log::Record) -> std::io::Result<()> {
    let info_style = buf
        .default_level_style(log::Level::Info)
        .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green)));
    let warn_style = buf
        .default_level_style(log::Level::Warn)
        .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow)));
    let error_style = buf
        .default_level_style(log::Level::Error)
        .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red)));

    let level_style = match record.level() {
        log::Level::Info => info_style,
        log::Level::Warn => warn_style,
        log::Level::Error => error_style,
        _ => buf.default_level_style(record.level()),
    };
    let grey_style = info_style.fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110))));
    let black_style = info_style.fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(75, 75, 75))));

    let line = record.line().unwrap_or(!0);
    let file = record.file().unwrap_or("").rsplit(['\\', '/']).next().unwrap_or("");
    let time = chrono::Local::now().format("%H:%M:%S");
    let level = record.level();

    writeln!(
        buf,
        "{level_style}[{time}] {level}{level_style:#} {grey_style}[{file}:{line}]{grey_style:#} \
         {black_style}{}{black_style:#}",
        record.args()
    )
}

/// 初始化全局 logger，默认级别为 Info，可以通过 `RUST_LOG` 覆盖
pub fn init_log() {
    env_logger::Builder::new()
        .format(format_record)
        .filter(None, log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

/// 单元测试使用的 logger
///
/// 可以被多个测试重复调用，只有第一次生效；输出会被 test harness 捕获
pub fn init_test_log() {
    let _ = env_logger::Builder::new()
        .format(format_record)
        .filter(None, log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}
