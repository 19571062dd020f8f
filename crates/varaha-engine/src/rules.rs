//! Rule manager: compiles a strategy's declarative definition once at
//! load time and evaluates it every tick.
//!
//! ## Compilation
//!
//! Condition trees (nested AND/OR over `{fact, op, value}` leaves) become
//! immutable `CompiledCondition` values; scoring formula strings become
//! RPN programs over fact references. Nothing is re-parsed per tick.
//!
//! Unknown or malformed condition *nodes* compile to a trivially-true
//! leaf with a warning - documented leniency so a configuration typo
//! shows up as "rule fires" rather than masking itself as "rule never
//! fires". A malformed *score formula* is fatal at compile time: running
//! with a broken rule set is worse than not running.
//!
//! ## Evaluation
//!
//! `evaluate` returns the union of all triggered rules' actions ordered
//! by each action's declared `sequence` ascending (missing sequence =
//! lowest priority, executed last). Rules are otherwise unordered
//! relative to each other. `evaluate_score` returns the maximum score
//! across matching rules: strongest signal wins, not cumulative.

use crate::facts::FactOverride;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;
use varaha_models::{FactMap, FactValue, Instrument};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule '{rule}' has a malformed score formula: {detail}")]
    ScoreFormula { rule: String, detail: String },
}

// =============================================================================
// Declarative definition (what operators write)
// =============================================================================

/// One declared action on a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDef {
    /// Action type, e.g. "enter_credit_spread", "square_off", "alert".
    #[serde(rename = "type")]
    pub kind: String,
    /// Execution order within one evaluation pass. Missing = executed
    /// after every sequenced action.
    #[serde(default)]
    pub sequence: Option<u32>,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// One declarative rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    /// Nested AND/OR tree of `{fact, op, value}` leaves.
    #[serde(default)]
    pub conditions: Value,
    /// Optional scoring formula over fact names.
    #[serde(default)]
    pub score: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// The strategy definition consumed from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Instruments this strategy scans.
    #[serde(default)]
    pub universe: Vec<Instrument>,
    /// Strategy parameters, exposed to rules as facts.
    #[serde(default)]
    pub params: HashMap<String, f64>,
    /// Per-fact tuning overrides.
    #[serde(default)]
    pub facts: HashMap<String, FactOverride>,
    /// Per-instrument rules.
    #[serde(default)]
    pub rules: Vec<RuleDef>,
    /// Engine-global rules, evaluated once per tick without instrument
    /// facts.
    #[serde(default)]
    pub engine_rules: Vec<RuleDef>,
}

impl StrategyDefinition {
    /// Load a strategy definition from a TOML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| anyhow::anyhow!("Could not find strategy file: {}", path))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("Failed to parse strategy: {}", e))
    }
}

// =============================================================================
// Compiled conditions
// =============================================================================

/// Comparison operator on a condition leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl CmpOp {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            ">" | "gt" => Some(CmpOp::Gt),
            ">=" | "gte" => Some(CmpOp::Gte),
            "<" | "lt" => Some(CmpOp::Lt),
            "<=" | "lte" => Some(CmpOp::Lte),
            "==" | "=" | "eq" => Some(CmpOp::Eq),
            "!=" | "ne" => Some(CmpOp::Ne),
            _ => None,
        }
    }
}

/// Compiled boolean expression.
#[derive(Debug, Clone)]
pub enum CompiledCondition {
    All(Vec<CompiledCondition>),
    Any(Vec<CompiledCondition>),
    Leaf {
        fact: String,
        op: CmpOp,
        value: FactValue,
    },
    /// Leniency fallback for unknown/malformed nodes.
    True,
}

impl CompiledCondition {
    pub fn matches(&self, facts: &FactMap) -> bool {
        match self {
            CompiledCondition::All(children) => children.iter().all(|c| c.matches(facts)),
            CompiledCondition::Any(children) => children.iter().any(|c| c.matches(facts)),
            CompiledCondition::True => true,
            CompiledCondition::Leaf { fact, op, value } => {
                let Some(actual) = facts.get(fact) else {
                    return false;
                };
                match (actual.as_f64(), value.as_f64()) {
                    (Some(a), Some(b)) => match op {
                        CmpOp::Gt => a > b,
                        CmpOp::Gte => a >= b,
                        CmpOp::Lt => a < b,
                        CmpOp::Lte => a <= b,
                        CmpOp::Eq => a == b,
                        CmpOp::Ne => a != b,
                    },
                    // Text facts only support (in)equality.
                    _ => match op {
                        CmpOp::Eq => actual == value,
                        CmpOp::Ne => actual != value,
                        _ => false,
                    },
                }
            }
        }
    }
}

/// Compile one condition node, leniently.
fn compile_condition(node: &Value) -> CompiledCondition {
    if let Some(obj) = node.as_object() {
        if let Some(children) = obj.get("all").and_then(|v| v.as_array()) {
            return CompiledCondition::All(children.iter().map(compile_condition).collect());
        }
        if let Some(children) = obj.get("any").and_then(|v| v.as_array()) {
            return CompiledCondition::Any(children.iter().map(compile_condition).collect());
        }
        let fact = obj.get("fact").and_then(|v| v.as_str());
        let op = obj
            .get("op")
            .or_else(|| obj.get("operator"))
            .and_then(|v| v.as_str())
            .and_then(CmpOp::parse);
        let value = obj.get("value").and_then(json_to_fact_value);
        if let (Some(fact), Some(op), Some(value)) = (fact, op, value) {
            return CompiledCondition::Leaf {
                fact: fact.to_string(),
                op,
                value,
            };
        }
    }
    warn!(node = %node, "[RULES] unknown condition node, compiling to always-true");
    CompiledCondition::True
}

fn json_to_fact_value(v: &Value) -> Option<FactValue> {
    match v {
        Value::Number(n) => n.as_f64().map(FactValue::Num),
        Value::String(s) => Some(FactValue::Text(s.clone())),
        Value::Bool(b) => Some(FactValue::Flag(*b)),
        _ => None,
    }
}

// =============================================================================
// Score programs
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum ScoreTok {
    Num(f64),
    Fact(String),
    Add,
    Sub,
    Mul,
    Div,
    Neg,
}

/// A scoring formula compiled to RPN once at load time.
#[derive(Debug, Clone)]
pub struct ScoreProgram {
    rpn: Vec<ScoreTok>,
}

impl ScoreProgram {
    /// Compile an infix formula over fact names, numeric literals,
    /// `+ - * /`, unary minus and parentheses.
    pub fn compile(expr: &str) -> Result<Self, String> {
        let tokens = tokenize(expr)?;
        let rpn = to_rpn(tokens)?;
        // Validate stack discipline so eval can never underflow.
        let mut depth = 0i32;
        for tok in &rpn {
            match tok {
                ScoreTok::Num(_) | ScoreTok::Fact(_) => depth += 1,
                ScoreTok::Neg => {
                    if depth < 1 {
                        return Err("dangling unary operator".to_string());
                    }
                }
                _ => {
                    depth -= 1;
                    if depth < 1 {
                        return Err("dangling binary operator".to_string());
                    }
                }
            }
        }
        if depth != 1 {
            return Err("expression does not reduce to one value".to_string());
        }
        Ok(Self { rpn })
    }

    /// Evaluate against a fact map. Missing facts read 0.0; division by
    /// zero yields 0.0.
    pub fn eval(&self, facts: &FactMap) -> f64 {
        let mut stack: Vec<f64> = Vec::with_capacity(8);
        for tok in &self.rpn {
            match tok {
                ScoreTok::Num(v) => stack.push(*v),
                ScoreTok::Fact(name) => {
                    stack.push(facts.get(name).and_then(|v| v.as_f64()).unwrap_or(0.0))
                }
                ScoreTok::Neg => {
                    let a = stack.pop().unwrap_or(0.0);
                    stack.push(-a);
                }
                op => {
                    let b = stack.pop().unwrap_or(0.0);
                    let a = stack.pop().unwrap_or(0.0);
                    stack.push(match op {
                        ScoreTok::Add => a + b,
                        ScoreTok::Sub => a - b,
                        ScoreTok::Mul => a * b,
                        ScoreTok::Div => {
                            if b == 0.0 {
                                0.0
                            } else {
                                a / b
                            }
                        }
                        _ => unreachable!(),
                    });
                }
            }
        }
        stack.pop().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RawTok {
    Operand(ScoreTok),
    Op(ScoreTok, u8), // operator and precedence
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<RawTok>, String> {
    let mut out = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                out.push(RawTok::LParen);
                i += 1;
            }
            ')' => {
                out.push(RawTok::RParen);
                i += 1;
            }
            '+' => {
                out.push(RawTok::Op(ScoreTok::Add, 1));
                i += 1;
            }
            '*' => {
                out.push(RawTok::Op(ScoreTok::Mul, 2));
                i += 1;
            }
            '/' => {
                out.push(RawTok::Op(ScoreTok::Div, 2));
                i += 1;
            }
            '-' => {
                // Unary when at expression start, after an operator, or
                // after an opening paren.
                let unary = matches!(
                    out.last(),
                    None | Some(RawTok::Op(_, _)) | Some(RawTok::LParen)
                );
                if unary {
                    out.push(RawTok::Op(ScoreTok::Neg, 3));
                } else {
                    out.push(RawTok::Op(ScoreTok::Sub, 1));
                }
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num: f64 = text.parse().map_err(|_| format!("bad number '{}'", text))?;
                out.push(RawTok::Operand(ScoreTok::Num(num)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                out.push(RawTok::Operand(ScoreTok::Fact(name)));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    if out.is_empty() {
        return Err("empty formula".to_string());
    }
    Ok(out)
}

fn to_rpn(tokens: Vec<RawTok>) -> Result<Vec<ScoreTok>, String> {
    let mut output = Vec::new();
    let mut ops: Vec<RawTok> = Vec::new();
    for tok in tokens {
        match tok {
            RawTok::Operand(t) => output.push(t),
            RawTok::Op(_, prec) => {
                loop {
                    // Neg is right-associative; binaries are left.
                    let should_pop = match ops.last() {
                        Some(RawTok::Op(top, top_prec)) => {
                            if *top == ScoreTok::Neg {
                                *top_prec > prec
                            } else {
                                *top_prec >= prec
                            }
                        }
                        _ => false,
                    };
                    if !should_pop {
                        break;
                    }
                    if let Some(RawTok::Op(t, _)) = ops.pop() {
                        output.push(t);
                    }
                }
                ops.push(tok);
            }
            RawTok::LParen => ops.push(tok),
            RawTok::RParen => loop {
                match ops.pop() {
                    Some(RawTok::Op(t, _)) => output.push(t),
                    Some(RawTok::LParen) => break,
                    _ => return Err("mismatched parenthesis".to_string()),
                }
            },
        }
    }
    while let Some(tok) = ops.pop() {
        match tok {
            RawTok::Op(t, _) => output.push(t),
            _ => return Err("mismatched parenthesis".to_string()),
        }
    }
    Ok(output)
}

// =============================================================================
// Compiled strategy
// =============================================================================

/// One rule after compilation: immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub priority: i32,
    condition: CompiledCondition,
    score: Option<ScoreProgram>,
    pub actions: Vec<ActionDef>,
}

/// An action that fired, tagged with the rule that declared it.
#[derive(Debug, Clone)]
pub struct TriggeredAction {
    pub rule: String,
    pub action: ActionDef,
}

impl TriggeredAction {
    fn sequence_key(&self) -> u32 {
        self.action.sequence.unwrap_or(u32::MAX)
    }
}

/// The full compiled strategy.
#[derive(Debug, Clone)]
pub struct CompiledStrategy {
    pub name: String,
    pub version: String,
    pub config_hash: String,
    pub universe: Vec<Instrument>,
    pub params: HashMap<String, f64>,
    pub fact_overrides: HashMap<String, FactOverride>,
    rules: Vec<CompiledRule>,
    engine_rules: Vec<CompiledRule>,
}

impl CompiledStrategy {
    /// Stable identity: "{name}:{version}:{hash[..8]}".
    pub fn strategy_id(&self) -> String {
        let short = &self.config_hash[..8.min(self.config_hash.len())];
        format!("{}:{}:{}", self.name, self.version, short)
    }

    /// Evaluate per-instrument rules; actions ordered by sequence.
    pub fn evaluate(&self, facts: &FactMap) -> Vec<TriggeredAction> {
        Self::eval_rules(&self.rules, facts)
    }

    /// Evaluate engine-global rules; actions ordered by sequence.
    pub fn evaluate_engine(&self, facts: &FactMap) -> Vec<TriggeredAction> {
        Self::eval_rules(&self.engine_rules, facts)
    }

    /// Maximum score across matching rules. Non-matching rules
    /// contribute nothing; no match at all reads 0.0.
    pub fn evaluate_score(&self, facts: &FactMap) -> f64 {
        self.rules
            .iter()
            .filter(|r| r.condition.matches(facts))
            .filter_map(|r| r.score.as_ref().map(|s| s.eval(facts)))
            .fold(0.0, f64::max)
    }

    fn eval_rules(rules: &[CompiledRule], facts: &FactMap) -> Vec<TriggeredAction> {
        let mut triggered: Vec<TriggeredAction> = rules
            .iter()
            .filter(|r| r.condition.matches(facts))
            .flat_map(|r| {
                r.actions.iter().map(move |a| TriggeredAction {
                    rule: r.name.clone(),
                    action: a.clone(),
                })
            })
            .collect();
        triggered.sort_by_key(|t| t.sequence_key());
        triggered
    }
}

/// Compiles declarative strategy definitions. One-time, at load.
pub struct RuleManager;

impl RuleManager {
    pub fn compile(def: &StrategyDefinition) -> Result<CompiledStrategy, RuleError> {
        let rules = Self::compile_rules(&def.rules)?;
        let engine_rules = Self::compile_rules(&def.engine_rules)?;
        Ok(CompiledStrategy {
            name: def.name.clone(),
            version: def.version.clone(),
            config_hash: config_hash(def),
            universe: def.universe.clone(),
            params: def.params.clone(),
            fact_overrides: def.facts.clone(),
            rules,
            engine_rules,
        })
    }

    /// Compiled rules are held in descending priority order so evaluation
    /// order is deterministic; action execution order remains governed by
    /// `sequence` alone.
    fn compile_rules(defs: &[RuleDef]) -> Result<Vec<CompiledRule>, RuleError> {
        let mut compiled = defs
            .iter()
            .map(|def| {
                let score = match &def.score {
                    Some(expr) => Some(ScoreProgram::compile(expr).map_err(|detail| {
                        RuleError::ScoreFormula {
                            rule: def.name.clone(),
                            detail,
                        }
                    })?),
                    None => None,
                };
                Ok(CompiledRule {
                    name: def.name.clone(),
                    priority: def.priority,
                    condition: compile_condition(&def.conditions),
                    score,
                    actions: def.actions.clone(),
                })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;
        compiled.sort_by_key(|r| std::cmp::Reverse(r.priority));
        Ok(compiled)
    }
}

/// SHA-256 over the canonicalized definition: strategy identity for
/// audit. Round-tripping through `serde_json::Value` sorts object keys,
/// so the same definition hashes identically across restarts.
fn config_hash(def: &StrategyDefinition) -> String {
    let canonical = serde_json::to_value(def).unwrap_or_default();
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

// =============================================================================
// Fact merging and instrument lookup
// =============================================================================

/// Merge fact maps from all providers into one flat mapping. Later
/// sources win on name collision.
pub fn merge_facts(sources: &[&FactMap]) -> FactMap {
    let mut merged = FactMap::new();
    for source in sources {
        for (k, v) in source.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Neutral placeholders for a data-less instrument, so downstream scoring
/// does not trip on cold instruments.
pub fn neutral_instrument_facts() -> FactMap {
    FactMap::from([
        ("adx".to_string(), FactValue::Num(0.0)),
        ("ema_fast".to_string(), FactValue::Num(0.0)),
        ("ema_mid".to_string(), FactValue::Num(0.0)),
        ("ema_slow".to_string(), FactValue::Num(0.0)),
        ("ema_long".to_string(), FactValue::Num(0.0)),
        ("rsi".to_string(), FactValue::Num(50.0)),
        ("supertrend_dir".to_string(), FactValue::Num(0.0)),
    ])
}

/// Look up an instrument's live facts: prefixed "EXCHANGE:TOKEN" key
/// first, bare token as fallback, neutral placeholders otherwise.
pub fn lookup_instrument_facts(
    live: &HashMap<String, FactMap>,
    instrument: &Instrument,
) -> FactMap {
    if let Some(facts) = live.get(&instrument.feed_key()) {
        return facts.clone();
    }
    if let Some(facts) = live.get(&instrument.token) {
        return facts.clone();
    }
    neutral_instrument_facts()
}
