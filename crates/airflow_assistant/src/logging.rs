use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Logs always go to stderr so answers
/// printed on stdout stay clean.
pub fn setup_logging(verbose_level: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_for(verbose_level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

fn filter_for(verbose_level: u8) -> &'static str {
    match verbose_level {
        0 => "warn,airflow_assistant=info,llm=info",
        1 => "info,airflow_assistant=debug,llm=debug",
        _ => "debug,airflow_assistant=trace,llm=trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_maps_to_filters() {
        assert_eq!(filter_for(0), "warn,airflow_assistant=info,llm=info");
        assert_eq!(filter_for(1), "info,airflow_assistant=debug,llm=debug");
        assert_eq!(filter_for(5), filter_for(2));
    }
}
