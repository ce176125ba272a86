// ABOUTME: emits a json schema for the agent request protocol to stdout.
// ABOUTME: intended for chat front ends that forward button clicks to sre-agentd.

fn main() {
    let schema = schemars::schema_for!(sre_agent_common::AgentRequest);
    let json = serde_json::to_string_pretty(&schema).expect("serialize schema");
    println!("{json}");
}
