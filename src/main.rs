use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use edgegate::*;

fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let path = std::env::var("CONFIG_PATH")
		.ok()
		.map(PathBuf::from)
		.or_else(|| std::env::args().nth(1).map(PathBuf::from))
		.unwrap_or_else(|| PathBuf::from("config.yaml"));

	let cfg = match config::load(&path) {
		Ok(cfg) => cfg,
		Err(err) => {
			error!("failed to load configuration: {err:#}");
			return ExitCode::from(1);
		},
	};

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(rt) => rt,
		Err(err) => {
			error!("failed to start runtime: {err}");
			return ExitCode::from(2);
		},
	};

	match runtime.block_on(app::run(cfg)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!("fatal runtime error: {err:#}");
			ExitCode::from(2)
		},
	}
}
