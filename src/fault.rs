use serde::Serialize;
use std::fmt;

/// A parameterized message: template text with `{0}`, `{1}`, ... slots plus
/// the ordered values that fill them. Used for validation faults and delta
/// lines alike, so either can be logged, asserted on, or shown verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub template: &'static str,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(template: &'static str, params: Vec<String>) -> Self {
        Self { template, params }
    }

    pub fn resolve(&self) -> String {
        let mut out = String::with_capacity(self.template.len() + 16);
        let mut rest = self.template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                rest = "";
                break;
            };
            match after[..close].parse::<usize>() {
                Ok(idx) if idx < self.params.len() => out.push_str(&self.params[idx]),
                _ => out.push_str(&rest[open..open + close + 2]),
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resolve())
    }
}

/// Resolved form used in JSON reports.
#[derive(Debug, Clone, Serialize)]
pub struct FaultReport {
    pub message: String,
    pub template: &'static str,
    pub params: Vec<String>,
}

impl From<&Message> for FaultReport {
    fn from(m: &Message) -> Self {
        Self {
            message: m.resolve(),
            template: m.template,
            params: m.params.clone(),
        }
    }
}

#[macro_export]
macro_rules! message {
    ($template:expr $(, $param:expr)* $(,)?) => {
        $crate::fault::Message::new($template, vec![$($param.to_string()),*])
    };
}
