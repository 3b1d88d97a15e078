use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::device::ChannelId;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TriggerConfigError {
    #[error("Malformed trigger request '{0}', expected '<chan>:<trigger>[,params]'")]
    InvalidFormat(String),

    #[error("Unknown trigger kind '{0}'")]
    UnknownKind(String),

    #[error("Trigger '{kind}' requires parameter '{name}'")]
    MissingParameter { kind: &'static str, name: &'static str },

    #[error("Invalid number '{0}' in trigger request")]
    InvalidNumber(String),
}

/// Gating rule applied to a channel stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerKind {
    Off,
    On,
    EdgeRising { level: f64 },
    EdgeFalling { level: f64 },
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Off => "off",
            TriggerKind::On => "on",
            TriggerKind::EdgeRising { .. } => "er",
            TriggerKind::EdgeFalling { .. } => "ef",
        }
    }

    pub fn is_edge(&self) -> bool {
        matches!(self, TriggerKind::EdgeRising { .. } | TriggerKind::EdgeFalling { .. })
    }

    pub fn level(&self) -> Option<f64> {
        match self {
            TriggerKind::EdgeRising { level } | TriggerKind::EdgeFalling { level } => Some(*level),
            TriggerKind::Off | TriggerKind::On => None,
        }
    }

    /// Whether the consecutive pair `(a, b)` crosses the level in this kind's direction.
    ///
    /// The earlier sample may sit exactly on the level.
    pub fn crosses(&self, a: f64, b: f64) -> bool {
        match self {
            TriggerKind::EdgeRising { level } => a <= *level && *level < b,
            TriggerKind::EdgeFalling { level } => a >= *level && *level > b,
            TriggerKind::Off | TriggerKind::On => false,
        }
    }
}

/// Complete trigger configuration for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerSpec {
    pub kind: TriggerKind,
    /// Edge is detected on this channel instead of the captured one.
    pub source_channel: Option<ChannelId>,
    pub vector_index: usize,
    /// Samples of pre-trigger history released together with the trigger point.
    pub horizontal_offset: usize,
}

impl TriggerSpec {
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            kind,
            source_channel: None,
            vector_index: 0,
            horizontal_offset: 0,
        }
    }

    pub fn always_on() -> Self {
        Self::new(TriggerKind::On)
    }

    pub fn always_off() -> Self {
        Self::new(TriggerKind::Off)
    }

    pub fn start_capturing_when() -> EdgeTriggerBuilder {
        EdgeTriggerBuilder::new()
    }

    /// Cross-channel source, only meaningful for edge kinds.
    pub fn cross_source(&self) -> Option<ChannelId> {
        if self.kind.is_edge() {
            self.source_channel
        } else {
            None
        }
    }

    /// Index of the first consecutive pair in `samples` that satisfies the edge condition.
    ///
    /// Pairs where either sample lacks the tested vector component never match.
    pub fn find_crossing<'a, I>(&self, samples: I) -> Option<usize>
    where
        I: IntoIterator<Item = &'a crate::device::Sample>,
    {
        if !self.kind.is_edge() {
            return None;
        }
        let mut previous: Option<f64> = None;
        for (idx, sample) in samples.into_iter().enumerate() {
            let current = sample.value(self.vector_index);
            if let (Some(a), Some(b)) = (previous, current) {
                if self.kind.crosses(a, b) {
                    return Some(idx - 1);
                }
            }
            previous = current;
        }
        None
    }

    /// Parse the body of a trigger request, e.g. `er#2@1,10,-0.5`.
    ///
    /// `channel` is the channel the request is bound to; a source pointing to
    /// the same channel is dropped.
    pub fn parse_request(body: &str, channel: TriggerKey) -> Result<Self, TriggerConfigError> {
        let body: String = body.chars().filter(|c| !c.is_whitespace()).collect();
        let mut fields = body.split(',');
        let head = fields
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TriggerConfigError::InvalidFormat(body.clone()))?;

        let kind_end = head.find(['#', '@']).unwrap_or(head.len());
        let (kind_str, mut rest) = head.split_at(kind_end);

        let mut source = None;
        let mut vector_index = 0;
        while !rest.is_empty() {
            let marker = rest.as_bytes()[0];
            let value_end = rest[1..].find(['#', '@']).map_or(rest.len(), |i| i + 1);
            let value = &rest[1..value_end];
            match marker {
                b'#' => source = Some(parse_number::<ChannelId>(value)?),
                _ => vector_index = parse_number::<usize>(value)?,
            }
            rest = &rest[value_end..];
        }

        if let (Some(src), TriggerKey::Channel(chan)) = (source, channel) {
            if src == chan {
                source = None;
            }
        }

        let params: Vec<&str> = fields.collect();
        let kind = match kind_str {
            "off" => TriggerKind::Off,
            "on" => TriggerKind::On,
            "er" => TriggerKind::EdgeRising {
                level: edge_level(&params, "er")?,
            },
            "ef" => TriggerKind::EdgeFalling {
                level: edge_level(&params, "ef")?,
            },
            other => return Err(TriggerConfigError::UnknownKind(other.to_string())),
        };

        let horizontal_offset = if kind.is_edge() {
            params
                .first()
                .ok_or(TriggerConfigError::MissingParameter {
                    kind: kind.as_str(),
                    name: "hoffset",
                })
                .and_then(|h| parse_number::<usize>(h))?
        } else {
            0
        };

        Ok(Self {
            kind,
            source_channel: source,
            vector_index,
            horizontal_offset,
        })
    }
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self::always_on()
    }
}

impl fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(src) = self.source_channel {
            write!(f, "#{}", src)?;
        }
        if self.vector_index != 0 {
            write!(f, "@{}", self.vector_index)?;
        }
        if let Some(level) = self.kind.level() {
            write!(f, ",{},{}", self.horizontal_offset, level)?;
        }
        Ok(())
    }
}

fn edge_level(params: &[&str], kind: &'static str) -> Result<f64, TriggerConfigError> {
    params
        .get(1)
        .ok_or(TriggerConfigError::MissingParameter { kind, name: "level" })
        .and_then(|level| parse_number(level))
}

fn parse_number<T: FromStr>(s: &str) -> Result<T, TriggerConfigError> {
    s.parse()
        .map_err(|_| TriggerConfigError::InvalidNumber(s.to_string()))
}

#[derive(Debug)]
pub struct EdgeTriggerBuilder {
    source_channel: Option<ChannelId>,
    vector_index: usize,
    horizontal_offset: usize,
}

impl EdgeTriggerBuilder {
    pub fn new() -> Self {
        Self {
            source_channel: None,
            vector_index: 0,
            horizontal_offset: 0,
        }
    }

    /// Detect the edge on another channel.
    pub fn on_channel(mut self, source: ChannelId) -> Self {
        self.source_channel = Some(source);
        self
    }

    pub fn vector(mut self, index: usize) -> Self {
        self.vector_index = index;
        self
    }

    pub fn with_history(mut self, samples: usize) -> Self {
        self.horizontal_offset = samples;
        self
    }

    pub fn rising_edge(self, level: f64) -> TriggerSpec {
        self.build(TriggerKind::EdgeRising { level })
    }

    pub fn falling_edge(self, level: f64) -> TriggerSpec {
        self.build(TriggerKind::EdgeFalling { level })
    }

    fn build(self, kind: TriggerKind) -> TriggerSpec {
        TriggerSpec {
            kind,
            source_channel: self.source_channel,
            vector_index: self.vector_index,
            horizontal_offset: self.horizontal_offset,
        }
    }
}

impl Default for EdgeTriggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Key of a trigger map entry: a concrete channel or every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKey {
    Global,
    Channel(ChannelId),
}

impl From<ChannelId> for TriggerKey {
    fn from(id: ChannelId) -> Self {
        Self::Channel(id)
    }
}

impl FromStr for TriggerKey {
    type Err = TriggerConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "g" => Ok(Self::Global),
            other => parse_number::<ChannelId>(other).map(Self::Channel),
        }
    }
}

/// Trigger configuration per channel, with an optional catch-all entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerMap {
    entries: HashMap<TriggerKey, TriggerSpec>,
}

impl TriggerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<TriggerKey>, spec: TriggerSpec) -> Self {
        self.insert(key, spec);
        self
    }

    pub fn insert(&mut self, key: impl Into<TriggerKey>, spec: TriggerSpec) {
        self.entries.insert(key.into(), spec);
    }

    pub fn get(&self, key: TriggerKey) -> Option<&TriggerSpec> {
        self.entries.get(&key)
    }

    /// Exact channel entry, then the global entry.
    pub fn lookup(&self, channel: ChannelId) -> Option<&TriggerSpec> {
        self.get(TriggerKey::Channel(channel))
            .or_else(|| self.get(TriggerKey::Global))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl FromStr for TriggerMap {
    type Err = TriggerConfigError;

    /// Parse `'<chan|g>:<trigger>[#src][@vect][,hoffset,level]; ...'`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = Self::new();
        for request in s.split(';').filter(|r| !r.trim().is_empty()) {
            let (chan, body) = request
                .split_once(':')
                .ok_or_else(|| TriggerConfigError::InvalidFormat(request.trim().to_string()))?;
            let key: TriggerKey = chan.parse()?;
            map.insert(key, TriggerSpec::parse_request(body, key)?);
        }
        Ok(map)
    }
}
