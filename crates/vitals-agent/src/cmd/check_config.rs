use vitals_agent::{AgentConfig, AgentResult, Category};

/// Print the effective (validated) configuration and derived values.
pub fn run_check_config(config: &AgentConfig) -> AgentResult<()> {
    let yaml = serde_yaml_ng::to_string(config)
        .map_err(|e| std::io::Error::other(format!("render config: {e}")))?;
    println!("{yaml}");
    println!("# derived");
    for category in Category::ALL {
        println!("#   {category} upload url: {}", config.category_url(category));
    }
    println!("#   health url: {}", config.health_url());
    for category in Category::ALL {
        println!("#   {category} inbox: {}", config.inbox_path(category).display());
    }
    println!(
        "#   cadence: ingest {:?}, upload {:?}, ping {:?}",
        config.ingest_interval(),
        config.upload_interval(),
        config.ping_interval()
    );
    Ok(())
}
