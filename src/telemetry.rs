use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Install a fmt subscriber filtered by `config.log_filter`.
/// Returns false if a global subscriber was already installed.
pub fn init(config: &Config) -> bool {
   let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
   return tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_target(false)
      .try_init()
      .is_ok();
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_init_is_idempotent() {
      let config = Config { log_filter: String::from("not a [valid filter"), ..Config::default() };
      init(&config);
      assert!(!init(&Config::default()));
   }
}
