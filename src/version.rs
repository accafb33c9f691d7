use chrono::{DateTime, Local};

fn build_time() -> String {
    let build_timestamp: i64 = env!("BUILD_TIME").parse().unwrap_or(0);
    let build_datetime: DateTime<Local> = DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now);
    build_datetime.format("%Y-%m-%d %H:%M:%S %Z").to_string()
}

pub fn get_version_info() -> &'static str {
    Box::leak(
        format!(
            "voipuser {}\n\
         Build Time: {}\n\
         Git Commit: {}",
            env!("CARGO_PKG_VERSION"),
            build_time(),
            env!("GIT_COMMIT_HASH"),
        )
        .into_boxed_str(),
    )
}

pub fn get_short_version() -> &'static str {
    Box::leak(
        format!(
            "{}-{}",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_COMMIT_HASH")
        )
        .into_boxed_str(),
    )
}

/// Value for the SIP User-Agent header.
pub fn get_useragent() -> String {
    format!("voipuser/{}", env!("CARGO_PKG_VERSION"))
}
