//! Call settings and the per-connection session configuration
//!
//! `CallSettings` is the editable snapshot supplied by the settings side of the
//! product (template, prompt, voice, tool manifest). `SessionConfig` is built
//! from it on every connect and never changes for the life of a connection.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Default live model identifier.
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice.
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Bidirectional streaming endpoint of the live service.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default per-invocation tool timeout.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 5_000;

/// Prebuilt voices and the display alias shown for each.
pub const VOICE_CATALOG: &[(&str, &str)] = &[
    ("Zephyr", "Diamond"),
    ("Puck", "Ruby"),
    ("Charon", "Sapphire"),
    ("Luna", "Emerald"),
    ("Nova", "Amethyst"),
    ("Kore", "Topaz"),
    ("Fenrir", "Onyx"),
    ("Leda", "Opal"),
    ("Orus", "Garnet"),
    ("Aoede", "Aquamarine"),
    ("Callirrhoe", "Pearl"),
    ("Autonoe", "Peridot"),
    ("Enceladus", "Tourmaline"),
    ("Iapetus", "Turquoise"),
    ("Umbriel", "Jade"),
    ("Algieba", "Lapis Lazuli"),
    ("Despina", "Moonstone"),
    ("Erinome", "Sunstone"),
    ("Algenib", "Alexandrite"),
    ("Rasalgethi", "Bloodstone"),
    ("Laomedeia", "Zircon"),
    ("Achernar", "Spinel"),
    ("Alnilam", "Tanzanite"),
    ("Schedar", "Morganite"),
    ("Gacrux", "Jasper"),
    ("Pulcherrima", "Agate"),
    ("Achird", "Malachite"),
    ("Zubenelgenubi", "Obsidian"),
    ("Vindemiatrix", "Tiger's Eye"),
    ("Sadachbia", "Carnelian"),
    ("Sadaltager", "Citrine"),
    ("Sulafat", "Aventurine"),
];

/// Names of every prebuilt voice.
pub fn available_voices() -> impl Iterator<Item = &'static str> {
    VOICE_CATALOG.iter().map(|(name, _)| *name)
}

/// Display alias for a voice, e.g. `Zephyr` -> `Diamond`.
pub fn voice_alias(voice: &str) -> Option<&'static str> {
    VOICE_CATALOG
        .iter()
        .find(|(name, _)| *name == voice)
        .map(|(_, alias)| *alias)
}

/// What the agent answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    #[default]
    #[serde(alias = "audio")]
    Audio,
    #[serde(alias = "text")]
    Text,
}

/// How the remote agent should treat a tool response that arrives while it
/// is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scheduling {
    Interrupt,
    WhenIdle,
    Silent,
}

/// One function the agent may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments, in the service's OpenAPI subset.
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default = "default_true", alias = "is_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub scheduling: Option<Scheduling>,
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Some(parameters),
            enabled: true,
            scheduling: Some(Scheduling::Interrupt),
        }
    }
}

/// The editable list of tools offered to the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolManifest {
    tools: Vec<ToolDeclaration>,
}

impl ToolManifest {
    pub fn new(tools: Vec<ToolDeclaration>) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &[ToolDeclaration] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolDeclaration> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Tools currently enabled, in manifest order.
    pub fn enabled(&self) -> impl Iterator<Item = &ToolDeclaration> {
        self.tools.iter().filter(|t| t.enabled)
    }

    /// Flip a tool's enabled flag. Returns the new value, or `None` if absent.
    pub fn toggle(&mut self, name: &str) -> Option<bool> {
        let tool = self.tools.iter_mut().find(|t| t.name == name)?;
        tool.enabled = !tool.enabled;
        Some(tool.enabled)
    }

    /// Append a blank tool under the first free name of `new_function`,
    /// `new_function_1`, `new_function_2`, ... and return that name.
    pub fn add_blank(&mut self) -> String {
        let mut name = "new_function".to_string();
        let mut counter = 1;
        while self.get(&name).is_some() {
            name = format!("new_function_{}", counter);
            counter += 1;
        }
        self.tools.push(ToolDeclaration::new(
            name.clone(),
            "",
            json!({ "type": "OBJECT", "properties": {} }),
        ));
        name
    }

    /// Remove a tool by name. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.tools.len();
        self.tools.retain(|t| t.name != name);
        self.tools.len() != before
    }

    /// Replace the tool named `old_name`. Renaming onto a name already taken
    /// by another tool is rejected and leaves the manifest unchanged.
    pub fn update(&mut self, old_name: &str, updated: ToolDeclaration) -> VoiceResult<()> {
        if old_name != updated.name && self.get(&updated.name).is_some() {
            return Err(VoiceError::Config(format!(
                "tool with name \"{}\" already exists",
                updated.name
            )));
        }
        let slot = self
            .tools
            .iter_mut()
            .find(|t| t.name == old_name)
            .ok_or_else(|| VoiceError::Config(format!("no tool named \"{}\"", old_name)))?;
        *slot = updated;
        Ok(())
    }
}

/// Preset agent personas, each with a prompt and a tool set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Template {
    #[default]
    CustomerSupport,
    PersonalAssistant,
    NavigationSystem,
}

impl Template {
    pub const ALL: [Template; 3] = [
        Template::CustomerSupport,
        Template::PersonalAssistant,
        Template::NavigationSystem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Template::CustomerSupport => "customer-support",
            Template::PersonalAssistant => "personal-assistant",
            Template::NavigationSystem => "navigation-system",
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Template::CustomerSupport => {
                "You are a helpful and friendly customer support agent. Be conversational and concise."
            }
            Template::PersonalAssistant => {
                "You are a helpful and friendly personal assistant. Be proactive and efficient."
            }
            Template::NavigationSystem => {
                "You are a helpful and friendly navigation assistant. Provide clear and accurate directions."
            }
        }
    }

    pub fn tools(&self) -> ToolManifest {
        let tools = match self {
            Template::CustomerSupport => vec![
                ToolDeclaration::new(
                    "start_return",
                    "Starts the return process for an item, collecting necessary details from the user.",
                    object_schema(&[
                        ("orderId", "The ID of the order containing the item to be returned."),
                        ("itemName", "The name of the item the user wants to return."),
                        ("reason", "The reason the user is returning the item."),
                    ]),
                ),
                ToolDeclaration::new(
                    "get_order_status",
                    "Provides the current status of a user's order, searching by order ID or customer details.",
                    object_schema(&[
                        ("orderId", "The ID of the order to check."),
                        ("customerName", "The name of the customer who placed the order."),
                    ]),
                ),
                ToolDeclaration::new(
                    "speak_to_representative",
                    "Escalates the conversation to a human customer support representative.",
                    object_schema(&[("reason", "A brief summary of the user's issue.")]),
                ),
            ],
            Template::PersonalAssistant => vec![
                ToolDeclaration::new(
                    "create_calendar_event",
                    "Creates a new event in the user's calendar.",
                    object_schema(&[
                        ("summary", "The title or summary of the event."),
                        ("location", "The location of the event."),
                        ("startTime", "The start time of the event in ISO 8601 format."),
                        ("endTime", "The end time of the event in ISO 8601 format."),
                    ]),
                ),
                ToolDeclaration::new(
                    "send_email",
                    "Sends an email to a specified recipient.",
                    object_schema(&[
                        ("recipient", "The email address of the recipient."),
                        ("subject", "The subject line of the email."),
                        ("body", "The body content of the email."),
                    ]),
                ),
                ToolDeclaration::new(
                    "set_reminder",
                    "Sets a reminder for the user.",
                    object_schema(&[
                        ("task", "The task for the reminder."),
                        ("time", "The time for the reminder in ISO 8601 format."),
                    ]),
                ),
            ],
            Template::NavigationSystem => vec![
                ToolDeclaration::new(
                    "find_route",
                    "Finds a route to a specified destination.",
                    object_schema(&[
                        ("destination", "The destination address or landmark."),
                        ("modeOfTransport", "The mode of transport (e.g., driving, walking, cycling)."),
                    ]),
                ),
                ToolDeclaration::new(
                    "find_nearby_places",
                    "Finds nearby places of a certain type.",
                    object_schema(&[
                        ("placeType", "The type of place to search for (e.g., restaurant, gas station, park)."),
                        ("radius", "The search radius in kilometers."),
                    ]),
                ),
                ToolDeclaration::new(
                    "get_traffic_info",
                    "Gets real-time traffic information for a specified location.",
                    object_schema(&[("location", "The location to get traffic information for.")]),
                ),
            ],
        };
        ToolManifest::new(tools)
    }
}

impl FromStr for Template {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Template::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| VoiceError::Config(format!("unknown template \"{}\"", s)))
    }
}

fn object_schema(props: &[(&str, &str)]) -> Value {
    let properties: serde_json::Map<String, Value> = props
        .iter()
        .map(|(name, description)| {
            (
                name.to_string(),
                json!({ "type": "STRING", "description": description }),
            )
        })
        .collect();
    let required: Vec<&str> = props.iter().map(|(name, _)| *name).collect();
    json!({ "type": "OBJECT", "properties": properties, "required": required })
}

fn default_true() -> bool {
    true
}

/// Editable call settings, as loaded from file and environment.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSettings {
    pub model: String,
    pub voice: String,
    pub template: Template,
    pub system_prompt: String,
    pub tools: ToolManifest,
    pub modality: ResponseModality,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub tool_timeout_ms: u64,
    pub endpoint: String,
}

impl Default for CallSettings {
    fn default() -> Self {
        let template = Template::default();
        Self {
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            template,
            system_prompt: template.system_prompt().to_string(),
            tools: template.tools(),
            modality: ResponseModality::Audio,
            input_transcription: true,
            output_transcription: true,
            tool_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

/// On-disk / environment shape. Prompt and tools fall back to the template's.
#[derive(Debug, Deserialize)]
struct RawCallSettings {
    model: String,
    voice: String,
    template: Template,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    tools: Option<Vec<ToolDeclaration>>,
    modality: ResponseModality,
    input_transcription: bool,
    output_transcription: bool,
    tool_timeout_ms: u64,
    endpoint: String,
}

impl From<RawCallSettings> for CallSettings {
    fn from(raw: RawCallSettings) -> Self {
        Self {
            system_prompt: raw
                .system_prompt
                .unwrap_or_else(|| raw.template.system_prompt().to_string()),
            tools: raw
                .tools
                .map(ToolManifest::new)
                .unwrap_or_else(|| raw.template.tools()),
            model: raw.model,
            voice: raw.voice,
            template: raw.template,
            modality: raw.modality,
            input_transcription: raw.input_transcription,
            output_transcription: raw.output_transcription,
            tool_timeout_ms: raw.tool_timeout_ms,
            endpoint: raw.endpoint,
        }
    }
}

impl CallSettings {
    /// Load settings. Precedence: env `CALLERPRO__*` > file at `CALLERPRO_CONFIG`
    /// (default `config/callerpro.toml`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path = std::env::var("CALLERPRO_CONFIG")
            .unwrap_or_else(|_| "config/callerpro.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load from an explicit file (skipped when missing) plus the environment.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder()
            .set_default("model", DEFAULT_LIVE_MODEL)?
            .set_default("voice", DEFAULT_VOICE)?
            .set_default("template", Template::default().as_str())?
            .set_default("modality", "AUDIO")?
            .set_default("input_transcription", true)?
            .set_default("output_transcription", true)?
            .set_default("tool_timeout_ms", DEFAULT_TOOL_TIMEOUT_MS as i64)?
            .set_default("endpoint", DEFAULT_ENDPOINT)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("CALLERPRO").separator("__"))
            .build()?;

        let raw: RawCallSettings = built.try_deserialize()?;
        Ok(raw.into())
    }

    /// Switch persona: replaces both the tool manifest and the system prompt.
    pub fn set_template(&mut self, template: Template) {
        self.template = template;
        self.tools = template.tools();
        self.system_prompt = template.system_prompt().to_string();
    }

    pub fn tool_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tool_timeout_ms)
    }
}

/// Immutable configuration of one live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub model: String,
    pub modality: ResponseModality,
    pub voice: String,
    pub system_instruction: String,
    /// Enabled tools only.
    pub tools: Vec<ToolDeclaration>,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl SessionConfig {
    pub fn from_settings(settings: &CallSettings) -> VoiceResult<Self> {
        if settings.model.trim().is_empty() {
            return Err(VoiceError::Config("model must not be empty".to_string()));
        }
        if settings.voice.trim().is_empty() {
            return Err(VoiceError::Config("voice must not be empty".to_string()));
        }
        if voice_alias(&settings.voice).is_none() {
            warn!(target: "callerpro::config", voice = %settings.voice, "Voice is not in the prebuilt catalog");
        }
        Ok(Self {
            model: settings.model.clone(),
            modality: settings.modality,
            voice: settings.voice.clone(),
            system_instruction: settings.system_prompt.clone(),
            tools: settings.tools.enabled().cloned().collect(),
            input_transcription: settings.input_transcription,
            output_transcription: settings.output_transcription,
        })
    }

    /// Scheduling policy declared for a tool in this session.
    pub fn scheduling_for(&self, name: &str) -> Option<Scheduling> {
        self.tools
            .iter()
            .find(|t| t.name == name)
            .and_then(|t| t.scheduling)
    }
}
