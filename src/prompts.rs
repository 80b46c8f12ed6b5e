use crate::models::IncidentCard;

pub const INITIAL_USER_PROMPT: &str = "This incident requires immediate investigation. \
Use the available tools to check the current status and gather diagnostic information.";

/// System message that opens every investigation.
pub fn incident_system_prompt(card: &IncidentCard) -> String {
    let resource = &card.resource;
    format!(
        "You are an incident response assistant. Analyze the incident and use available tools to investigate and resolve it.

Incident Details:
{details}

Resource Information:
- Name: {name}
- Type: {kind}
- State: {state}
- Value: {value}
- Timestamp: {timestamp}

Instructions:
1. You MUST use the available tools to investigate the incident - do not provide analysis without tool data
2. Start by using appropriate tools to gather information about the current state
3. Use additional tools based on what you discover to get a complete picture
4. Only provide final recommendations after you have gathered sufficient information using tools
5. Use function calls - do not respond with JSON in text format

Available tools should be used to:
- Check status of systems and services
- Execute diagnostic commands
- Run specific actions to resolve issues",
        details = card.prompt.trim(),
        name = resource.name,
        kind = resource.r#type,
        state = resource.state,
        value = resource.value,
        timestamp = resource.timestamp,
    )
}
