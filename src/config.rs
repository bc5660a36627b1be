//! Configuração do slot-saga carregada a partir de `slot-saga.toml`.
//!
//! A struct [`SlotSagaConfig`] agrupa os parâmetros por seção (`jitter`,
//! `followup`, `breaker`, `idempotency`, `saga`, `rotation`). Seções ou campos
//! ausentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `SLOT_SAGA_STORE_PATH` tem precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::SlotSagaError;
use crate::resilience::CircuitBreakerConfig;
use crate::saga::StructuralValidator;
use crate::state_machine::{DEFAULT_PATTERNS, RotationStateMachine};
use crate::timing::{FollowupScheduler, JitterEngine};

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "slot-saga.toml";

/// Variável de ambiente que sobrescreve `store_path`.
pub const STORE_PATH_ENV: &str = "SLOT_SAGA_STORE_PATH";

/// Configuração de nível superior carregada de `slot-saga.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlotSagaConfig {
    #[serde(default)]
    pub jitter: JitterSettings,

    #[serde(default)]
    pub followup: FollowupSettings,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub idempotency: IdempotencySettings,

    #[serde(default)]
    pub saga: SagaSettings,

    #[serde(default)]
    pub rotation: RotationSettings,

    /// Caminho do arquivo JSON com o estado de rotação dos criadores.
    #[serde(default)]
    pub store_path: Option<String>,
}

/// Faixa de deslocamento (em minutos) aplicada pelo jitter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JitterSettings {
    pub min_offset_minutes: i64,
    pub max_offset_minutes: i64,
}

impl Default for JitterSettings {
    fn default() -> Self {
        Self {
            min_offset_minutes: -7,
            max_offset_minutes: 8,
        }
    }
}

/// Janela e distribuição dos follow-ups.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FollowupSettings {
    pub min_offset_minutes: i64,
    pub max_offset_minutes: i64,
    pub mean_minutes: f64,
    pub std_dev_minutes: f64,
    pub max_attempts: u32,
    /// Permite que o follow-up caia no dia seguinte ao envio pai.
    pub allow_next_day: bool,
    /// `send_type` atribuído aos follow-ups gerados.
    pub send_type: String,
}

impl Default for FollowupSettings {
    fn default() -> Self {
        Self {
            min_offset_minutes: 15,
            max_offset_minutes: 45,
            mean_minutes: 28.0,
            std_dev_minutes: 8.0,
            max_attempts: 100,
            allow_next_day: false,
            send_type: "ppv_followup".to_string(),
        }
    }
}

/// Parâmetros compartilhados por todos os circuit breakers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    /// Por quanto tempo um resultado de saga é reaproveitado.
    pub ttl_secs: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

/// Orçamentos de tempo por passo da saga.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaSettings {
    pub step_timeout_ms: u64,
    pub compensation_timeout_ms: u64,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            step_timeout_ms: 5_000,
            compensation_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    /// Sequências de estilo, uma letra por posição PPV (S, B, W, T).
    pub patterns: Vec<String>,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl SlotSagaConfig {
    /// Carrega a configuração de `slot-saga.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho específico.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::parse(&contents).with_context(|| format!("invalid config in {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o caminho do store.
        if let Ok(store_path) = std::env::var(STORE_PATH_ENV)
            && !store_path.is_empty()
        {
            config.store_path = Some(store_path);
        }

        Ok(config)
    }

    /// Interpreta o conteúdo TOML e valida as seções.
    pub fn parse(contents: &str) -> Result<Self, SlotSagaError> {
        let config: SlotSagaConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejeita janelas invertidas e valores que tornariam a saga inutilizável.
    pub fn validate(&self) -> Result<(), SlotSagaError> {
        if self.jitter.min_offset_minutes > self.jitter.max_offset_minutes {
            return Err(SlotSagaError::Config(format!(
                "jitter range [{}, {}] is inverted",
                self.jitter.min_offset_minutes, self.jitter.max_offset_minutes
            )));
        }
        let followup = &self.followup;
        if followup.min_offset_minutes < 0 || followup.min_offset_minutes > followup.max_offset_minutes {
            return Err(SlotSagaError::Config(format!(
                "follow-up window [{}, {}] is invalid",
                followup.min_offset_minutes, followup.max_offset_minutes
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(SlotSagaError::Config(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.saga.step_timeout_ms == 0 {
            return Err(SlotSagaError::Config("saga.step_timeout_ms must be positive".into()));
        }
        if self.rotation.patterns.is_empty() {
            return Err(SlotSagaError::Config("rotation.patterns must not be empty".into()));
        }
        Ok(())
    }

    pub fn jitter_engine(&self) -> Result<JitterEngine> {
        Ok(JitterEngine::new(
            self.jitter.min_offset_minutes,
            self.jitter.max_offset_minutes,
        )?)
    }

    pub fn followup_scheduler(&self) -> FollowupScheduler {
        FollowupScheduler {
            mean_minutes: self.followup.mean_minutes,
            std_dev_minutes: self.followup.std_dev_minutes,
            max_attempts: self.followup.max_attempts,
        }
    }

    pub fn rotation_machine(&self) -> Result<RotationStateMachine> {
        Ok(RotationStateMachine::new(self.rotation.patterns.clone())?)
    }

    /// Validador estrutural com a janela de follow-up alargada pelo jitter.
    pub fn structural_validator(&self) -> Result<StructuralValidator> {
        Ok(StructuralValidator {
            followup_min_offset: self.followup.min_offset_minutes,
            followup_max_offset: self.followup.max_offset_minutes,
            tolerance_minutes: self.jitter_engine()?.max_shift(),
        })
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            recovery_timeout: Duration::from_millis(self.breaker.recovery_timeout_ms),
        }
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency.ttl_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.saga.step_timeout_ms)
    }

    pub fn compensation_timeout(&self) -> Duration {
        Duration::from_millis(self.saga.compensation_timeout_ms)
    }

    /// Caminho efetivo do store JSON.
    pub fn store_path(&self) -> &str {
        self.store_path.as_deref().unwrap_or("rotation-state.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = SlotSagaConfig::default();
        assert_eq!(config.jitter.min_offset_minutes, -7);
        assert_eq!(config.jitter.max_offset_minutes, 8);
        assert_eq!(config.followup.min_offset_minutes, 15);
        assert_eq!(config.followup.max_offset_minutes, 45);
        assert!(!config.followup.allow_next_day);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.idempotency_ttl(), Duration::from_secs(3600));
        assert_eq!(config.step_timeout(), Duration::from_secs(5));
        assert_eq!(config.rotation.patterns.len(), 4);
        assert_eq!(config.store_path(), "rotation-state.json");
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            store_path = "/tmp/rotation.json"

            [followup]
            min_offset_minutes = 20
            allow_next_day = true

            [breaker]
            failure_threshold = 2
        "#;
        let config: SlotSagaConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.followup.min_offset_minutes, 20);
        assert_eq!(config.followup.max_offset_minutes, 45);
        assert!(config.followup.allow_next_day);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.recovery_timeout_ms, 30_000);
        assert_eq!(config.jitter.max_offset_minutes, 8);
        assert_eq!(config.store_path(), "/tmp/rotation.json");
    }

    #[test]
    fn load_from_file_and_build_components() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
            [jitter]
            min_offset_minutes = -3
            max_offset_minutes = 3

            [rotation]
            patterns = ["SB", "WT"]
            "#,
        )
        .unwrap();

        let config = SlotSagaConfig::load_from(&path).unwrap();
        assert_eq!(config.jitter_engine().unwrap().max_shift(), 3);
        assert_eq!(config.rotation_machine().unwrap().patterns().len(), 2);
        let validator = config.structural_validator().unwrap();
        assert_eq!(validator.tolerance_minutes, 3);
        assert_eq!(validator.followup_min_offset, 15);
    }

    #[test]
    fn invalid_sections_fail_to_build() {
        let mut config = SlotSagaConfig::default();
        config.jitter.min_offset_minutes = 10;
        config.jitter.max_offset_minutes = 0;
        assert!(config.jitter_engine().is_err());

        config.rotation.patterns = vec!["SXZ".into()];
        assert!(config.rotation_machine().is_err());
    }

    #[test]
    fn parse_rejects_invalid_sections() {
        let err = SlotSagaConfig::parse("[followup]\nmin_offset_minutes = 50\n").unwrap_err();
        assert!(matches!(err, SlotSagaError::Config(_)));

        let err = SlotSagaConfig::parse("[breaker]\nfailure_threshold = 0\n").unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));

        let err = SlotSagaConfig::parse("[saga\n").unwrap_err();
        assert!(matches!(err, SlotSagaError::Toml(_)));
    }

    #[test]
    fn load_from_reports_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[jitter]\nmin_offset_minutes = 9\nmax_offset_minutes = 1\n").unwrap();
        assert!(SlotSagaConfig::load_from(&path).is_err());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SlotSagaConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
    }
}
