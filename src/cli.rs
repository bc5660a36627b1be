//! Interface de linha de comando do slot-saga baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, demo)
//! e flags globais (--config, --step-timeout-ms, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// slot-saga: orquestração de horários de envio com rollback automático.
#[derive(Debug, Parser)]
#[command(name = "slot-saga", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho alternativo para o arquivo de configuração TOML.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Orçamento de tempo por passo da saga, em milissegundos.
    #[arg(long, global = true)]
    pub step_timeout_ms: Option<u64>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa a saga de agendamento para um criador.
    Run {
        /// Identificador do criador.
        creator: String,

        /// Arquivo JSON com a lista de itens do dia.
        #[arg(long)]
        file: PathBuf,
    },

    /// Executa a demonstração embutida (duas execuções, a segunda é replay).
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["slot-saga", "run", "creator-42", "--file", "day.json"]);
        match cli.command {
            Command::Run { creator, file } => {
                assert_eq!(creator, "creator-42");
                assert_eq!(file, PathBuf::from("day.json"));
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn run_requires_file() {
        assert!(Cli::try_parse_from(["slot-saga", "run", "creator-42"]).is_err());
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "slot-saga",
            "--step-timeout-ms",
            "250",
            "--config",
            "custom.toml",
            "--verbose",
            "demo",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.step_timeout_ms, Some(250));
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
