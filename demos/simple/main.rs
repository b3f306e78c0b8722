use serde_json::json;

pub fn main() {
    env_logger::init();

    let datafile = eventvisor::Datafile::from_value(json!({
        "schemaVersion": "1",
        "revision": "1",
        "attributes": {
            "userId": {"type": "string"}
        },
        "events": {
            "page_view": {
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "referrer": {"type": "string", "default": ""}
                },
                "required": ["url"],
                "transforms": [
                    {"type": "set", "target": "userId", "source": "attribute.userId"}
                ]
            }
        },
        "destinations": {
            "console": {"transport": "console"}
        },
        "effects": {
            "pageViews": {
                "on": {"event_tracked": ["page_view"]},
                "state": 0,
                "steps": [{"transforms": [{"type": "increment"}]}]
            }
        }
    }))
    .unwrap();

    // Transport that prints every event it receives.
    let console = eventvisor::Module::new("console").with_transport(|options| {
        println!(
            "[{}] {} -> {}: {}",
            options.event_level.as_str(),
            options.event_name,
            options.destination_name,
            options.payload
        );
        Ok(())
    });

    let instance = eventvisor::InstanceConfig::new()
        .with_datafile(datafile)
        .with_module(console)
        .to_instance()
        .unwrap();

    // Block waiting for attributes and effects to get initialized.
    instance.on_ready().unwrap();

    instance.set_attribute("userId", json!("user-123")).wait().unwrap();
    // Fire and forget: the outcome is not needed.
    let _ = instance.track("page_view", json!({"url": "/home"}));
    let _ = instance.track("page_view", json!({"url": "/pricing"}));

    // Invalid payload: dropped, with a warning logged.
    let dropped = instance.track("page_view", json!({"title": "no url"})).wait().unwrap();
    println!("Dropped event outcome: {:?}", dropped);

    println!("Page views: {:?}", instance.get_state_value("pageViews"));
}
