use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::model::GenerationParams;

const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_path: PathBuf,
    pub model_file: String,
    pub tokenizer_file: String,
    pub max_seq_length: usize,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub min_p: f64,
    pub token_timeout: Duration,
    pub stream_capacity: usize,
    pub image_size: u32,
    pub eager_load: bool,
    pub max_upload_bytes: usize,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::from_lookup(|key| env::var(key).ok()))
    }

    /// Builds the config from an arbitrary key lookup; unparsable values fall
    /// back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let host: IpAddr = parse_var(&lookup, "HOST").unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port: u16 = parse_var(&lookup, "PORT").unwrap_or(DEFAULT_PORT);
        let listen_addr = SocketAddr::new(host, port);

        let model_path =
            PathBuf::from(lookup("MODEL_PATH").unwrap_or_else(|| "models/Qwen2-VL-2B".to_string()));
        let model_file = lookup("MODEL_FILE").unwrap_or_else(|| "model.pt".to_string());
        let tokenizer_file =
            lookup("TOKENIZER_FILE").unwrap_or_else(|| "tokenizer.json".to_string());

        let max_seq_length: usize = parse_var(&lookup, "MAX_SEQ_LENGTH").unwrap_or(1024);
        let max_new_tokens: usize = parse_var(&lookup, "MAX_NEW_TOKENS").unwrap_or(256);
        let temperature: f64 = parse_var(&lookup, "TEMPERATURE").unwrap_or(1.5);
        let min_p: f64 = parse_var(&lookup, "MIN_P").unwrap_or(0.1);
        let token_timeout = parse_var::<u64, _>(&lookup, "TOKEN_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(30));
        let stream_capacity = parse_var::<usize, _>(&lookup, "STREAM_CAPACITY").unwrap_or(64).max(1);
        let image_size: u32 = parse_var(&lookup, "IMAGE_SIZE").unwrap_or(448);
        let eager_load = lookup("EAGER_LOAD")
            .map(|v| parse_flag(&v))
            .unwrap_or(true);
        let max_upload_bytes: usize = parse_var(&lookup, "MAX_UPLOAD_BYTES").unwrap_or(20 * 1024 * 1024);

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "auto".into());
            parse_device(&raw)
        };

        Self {
            listen_addr,
            model_path,
            model_file,
            tokenizer_file,
            max_seq_length,
            max_new_tokens,
            temperature,
            min_p,
            token_timeout,
            stream_capacity,
            image_size,
            eager_load,
            max_upload_bytes,
            #[cfg(feature = "tch-backend")]
            device,
        }
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            min_p: self.min_p,
            token_timeout: self.token_timeout,
            stream_capacity: self.stream_capacity,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::cuda_if_available()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_deployed_service() {
        let config = config_from(&[]);
        assert_eq!(config.listen_addr.port(), 5000);
        assert_eq!(config.max_seq_length, 1024);
        assert_eq!(config.max_new_tokens, 256);
        assert_eq!(config.temperature, 1.5);
        assert_eq!(config.min_p, 0.1);
        assert_eq!(config.token_timeout, Duration::from_secs(30));
        assert!(config.eager_load);
    }

    #[test]
    fn port_is_read_from_the_environment() {
        let config = config_from(&[("PORT", "8081")]);
        assert_eq!(config.listen_addr.port(), 8081);

        let fallback = config_from(&[("PORT", "not-a-port")]);
        assert_eq!(fallback.listen_addr.port(), 5000);
    }

    #[test]
    fn eager_load_can_be_disabled() {
        assert!(!config_from(&[("EAGER_LOAD", "false")]).eager_load);
        assert!(!config_from(&[("EAGER_LOAD", "0")]).eager_load);
        assert!(config_from(&[("EAGER_LOAD", "yes")]).eager_load);
    }

    #[test]
    fn generation_params_follow_config() {
        let config = config_from(&[("MAX_NEW_TOKENS", "32"), ("STREAM_CAPACITY", "0")]);
        let params = config.generation_params();
        assert_eq!(params.max_new_tokens, 32);
        assert_eq!(params.stream_capacity, 1);
    }
}
