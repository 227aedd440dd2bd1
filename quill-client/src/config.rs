use std::time::Duration;

use anyhow::Context;

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// A toggle not confirmed within this delay is rolled back
    pub mutation_timeout: Duration,

    pub load_timeout: Duration,

    /// How many times to re-fetch a thread that changed while being fetched
    pub snapshot_attempts: usize,

    /// Length, in characters, of the content quoted in notifications
    pub snippet_len: usize,

    /// How many loaded threads are kept to show when a reload fails
    pub cached_threads: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mutation_timeout: Duration::from_secs(10),
            load_timeout: Duration::from_secs(10),
            snapshot_attempts: 3,
            snippet_len: 50,
            cached_threads: 32,
        }
    }
}

fn env_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {name} environment variable")),
        Ok(v) => Ok(Some(
            v.parse()
                .with_context(|| format!("parsing {name} environment variable {v:?}"))?,
        )),
    }
}

impl Config {
    /// Defaults, overridden by the `QUILL_*` environment variables that are set
    pub fn from_env() -> anyhow::Result<Config> {
        let mut res = Config::default();
        if let Some(ms) = env_var::<u64>("QUILL_MUTATION_TIMEOUT_MS")? {
            res.mutation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_var::<u64>("QUILL_LOAD_TIMEOUT_MS")? {
            res.load_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_var("QUILL_SNAPSHOT_ATTEMPTS")? {
            res.snapshot_attempts = n;
        }
        if let Some(n) = env_var("QUILL_SNIPPET_LEN")? {
            res.snippet_len = n;
        }
        if let Some(n) = env_var("QUILL_CACHED_THREADS")? {
            res.cached_threads = n;
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only one test touches the environment, so that tests running in
    // parallel do not see each other's variables
    #[test]
    fn from_env() {
        std::env::remove_var("QUILL_LOAD_TIMEOUT_MS");
        std::env::remove_var("QUILL_SNAPSHOT_ATTEMPTS");
        std::env::remove_var("QUILL_CACHED_THREADS");
        std::env::set_var("QUILL_MUTATION_TIMEOUT_MS", "250");
        std::env::set_var("QUILL_SNIPPET_LEN", "12");
        let config = Config::from_env().unwrap();
        assert_eq!(config.mutation_timeout, Duration::from_millis(250));
        assert_eq!(config.snippet_len, 12);
        assert_eq!(config.load_timeout, Config::default().load_timeout);
        assert_eq!(config.snapshot_attempts, 3);
        assert_eq!(config.cached_threads, 32);

        std::env::set_var("QUILL_SNIPPET_LEN", "many");
        assert!(Config::from_env().is_err());
        std::env::remove_var("QUILL_SNIPPET_LEN");
        std::env::remove_var("QUILL_MUTATION_TIMEOUT_MS");
    }
}
