use chrono::{DateTime, Utc};
use clap::Args;
use serde_json::Value;
use vitals_agent::source::append_reading;
use vitals_agent::{AgentConfig, AgentError, AgentResult, Category, Reading};

use super::ConfigArgs;

#[derive(Args)]
pub struct RecordArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Event category: vitals or feedings
    pub category: Category,
    /// Reading payload as a JSON object, e.g. '{"ml": 120}'
    pub payload: String,
    /// Capture time (RFC 3339); the agent stamps ingestion time when omitted
    #[arg(long)]
    pub captured_at: Option<DateTime<Utc>>,
}

fn parse_payload(raw: &str) -> AgentResult<Value> {
    let payload: Value = serde_json::from_str(raw)
        .map_err(|e| AgentError::InvalidInput(format!("payload is not JSON: {e}")))?;
    if !payload.is_object() {
        return Err(AgentError::InvalidInput(
            "payload must be a JSON object".into(),
        ));
    }
    Ok(payload)
}

/// Append one manual reading to its category's inbox for the (running) agent.
pub fn run_record(config: &AgentConfig, args: &RecordArgs) -> AgentResult<()> {
    let reading = Reading {
        category: args.category,
        payload: parse_payload(&args.payload)?,
        captured_at: args.captured_at,
    };
    let inbox = append_reading(config.inbox_dir(), &reading)?;
    println!("recorded {} reading in {}", args.category, inbox.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_must_be_an_object() {
        assert!(parse_payload(r#"{"ml": 120}"#).is_ok());
        for raw in ["[1, 2]", "42", "null", "{not json"] {
            let err = parse_payload(raw).unwrap_err();
            assert!(matches!(err, AgentError::InvalidInput(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn record_writes_to_the_category_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            state_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let args = RecordArgs {
            config: ConfigArgs::default(),
            category: Category::Feeding,
            payload: r#"{"ml": 90}"#.into(),
            captured_at: None,
        };
        run_record(&config, &args).unwrap();

        let feedings = std::fs::read_to_string(config.inbox_path(Category::Feeding)).unwrap();
        assert!(feedings.contains("\"ml\":90"), "{feedings}");
        assert!(!config.inbox_path(Category::Vitals).exists());
    }

    #[test]
    fn rejected_payload_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            state_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let args = RecordArgs {
            config: ConfigArgs::default(),
            category: Category::Vitals,
            payload: "[]".into(),
            captured_at: None,
        };
        assert!(matches!(
            run_record(&config, &args),
            Err(AgentError::InvalidInput(_))
        ));
        assert!(!config.inbox_path(Category::Vitals).exists());
    }
}
