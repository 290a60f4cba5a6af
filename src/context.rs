//! Per-evaluation state: bindings, subject, flags, spirit and execution log.
//!
//! Contexts are forked, never shared. A fork copies the object bindings and
//! shares the type registry and spirit handle. After a nested run finishes
//! the parent keeps the child in its log as [`LogEntry::SubContext`].

use crate::invocation::InvocationEntry;
use crate::object::{ErrorObject, Object, ObjectCollection, Value};
use crate::registry::TypeModule;
use crate::types::TypeRef;
use crate::{Error, Interrupted};
use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

bitflags! {
    /// Evaluation flags. Only the low 16 bits name flags; the context keeps
    /// inherit-set bits shifted by 16 and inherit-remove bits shifted by 32.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InvocationFlags: u64 {
        const PRINT_STEP = 0x1;
        const RAISE_ERROR = 0x2;
        const SEQUENTIAL = 0x4;
    }
}

const FLAG_MASK: u64 = 0xFFFF;
const INHERIT_SET_SHIFT: u32 = 16;
const INHERIT_REMOVE_SHIFT: u32 = 32;

/// Where a flag change applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagScope {
    /// This context only
    Now,
    /// Set on every fork, not on this context
    InheritSet,
    /// Removed from every fork
    InheritRemove,
}

impl FlagScope {
    fn shift(self) -> u32 {
        match self {
            FlagScope::Now => 0,
            FlagScope::InheritSet => INHERIT_SET_SHIFT,
            FlagScope::InheritRemove => INHERIT_REMOVE_SHIFT,
        }
    }
}

/// Side channel of the running command: output and cancellation
pub trait Spirit: fmt::Debug + Send + Sync {
    /// Post a line of output. `tag` is a category such as `message` or `error`.
    fn post(&self, tag: &str, message: &str);

    /// Fails once the command has been asked to stop
    fn interruption_point(&self) -> Result<(), Interrupted> {
        Ok(())
    }
}

/// Spirit that keeps posts in memory
#[derive(Debug, Default)]
pub struct TempSpirit {
    posts: Mutex<Vec<(String, String)>>,
    interrupted: AtomicBool,
}

impl TempSpirit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Posted `(tag, message)` pairs in order
    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.posts().into_iter().map(|(_, m)| m).collect()
    }
}

impl Spirit for TempSpirit {
    fn post(&self, tag: &str, message: &str) {
        if let Ok(mut posts) = self.posts.lock() {
            posts.push((tag.to_string(), message.to_string()));
        }
    }

    fn interruption_point(&self) -> Result<(), Interrupted> {
        if self.interrupted.load(Ordering::SeqCst) {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// One entry of the execution log
#[derive(Debug)]
pub enum LogEntry {
    MessageBegin,
    /// A compiled reducer instruction
    Code(String),
    /// Invocation with this index is about to run
    EvalBegin(usize),
    EvalEnd(usize),
    MessageEnd,
    /// A nested run that forked from this context
    SubContext(Box<InvocationContext>),
}

#[derive(Debug)]
pub struct InvocationContext {
    type_module: Arc<TypeModule>,
    input_objects: ObjectCollection,
    subject: Option<Object>,
    spirit: Arc<dyn Spirit>,
    flags: u64,
    invocations: Vec<InvocationEntry>,
    log: Vec<LogEntry>,
    log_enabled: bool,
    extra_exception: Option<Error>,
    depth: usize,
}

impl InvocationContext {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Context over the fundamental registry with an in-memory spirit
    pub fn instant(subject: Option<Object>) -> Self {
        let mut builder = ContextBuilder::new();
        if let Some(subject) = subject {
            builder = builder.subject(subject);
        }
        builder.build()
    }

    /// Fork for a nested evaluation.
    ///
    /// The child gets the low flag bits plus the inherit-set bits, minus the
    /// inherit-remove bits. Bindings are copied; the log starts empty.
    pub fn inherit(&self, subject: Option<Object>) -> Self {
        let mut flags = (self.flags & FLAG_MASK) | ((self.flags >> INHERIT_SET_SHIFT) & FLAG_MASK);
        flags &= !((self.flags >> INHERIT_REMOVE_SHIFT) & FLAG_MASK);
        tracing::debug!(depth = self.depth + 1, flags, "fork context");
        InvocationContext {
            type_module: Arc::clone(&self.type_module),
            input_objects: self.input_objects.clone(),
            subject,
            spirit: Arc::clone(&self.spirit),
            flags,
            invocations: Vec::new(),
            log: Vec::new(),
            log_enabled: self.log_enabled,
            extra_exception: None,
            depth: self.depth + 1,
        }
    }

    /// Fork for repeated runs of one expression: a single reused log slot,
    /// errors raised instead of contained, no step printing.
    pub fn inherit_sequential(&self) -> Self {
        let mut child = self.inherit(None);
        child.remove_flags(InvocationFlags::PRINT_STEP, FlagScope::Now);
        child.set_flags(
            InvocationFlags::SEQUENTIAL | InvocationFlags::RAISE_ERROR,
            FlagScope::Now,
        );
        child.log_enabled = false;
        child
    }

    pub fn type_module(&self) -> &TypeModule {
        &self.type_module
    }

    pub fn type_module_handle(&self) -> Arc<TypeModule> {
        Arc::clone(&self.type_module)
    }

    pub fn spirit(&self) -> &Arc<dyn Spirit> {
        &self.spirit
    }

    pub fn post(&self, tag: &str, message: &str) {
        self.spirit.post(tag, message);
    }

    pub fn check_interruption(&self) -> Result<(), Interrupted> {
        self.spirit.interruption_point()
    }

    pub fn get_depth(&self) -> usize {
        self.depth
    }

    //
    // Flags
    //

    pub fn set_flags(&mut self, flags: InvocationFlags, scope: FlagScope) {
        self.flags |= flags.bits() << scope.shift();
    }

    pub fn remove_flags(&mut self, flags: InvocationFlags, scope: FlagScope) {
        self.flags &= !(flags.bits() << scope.shift());
    }

    pub fn get_flags(&self) -> InvocationFlags {
        InvocationFlags::from_bits_truncate(self.flags & FLAG_MASK)
    }

    pub fn is_set_print_step(&self) -> bool {
        self.get_flags().contains(InvocationFlags::PRINT_STEP)
    }

    pub fn is_set_raise_error(&self) -> bool {
        self.get_flags().contains(InvocationFlags::RAISE_ERROR)
    }

    pub fn is_sequential_invocation(&self) -> bool {
        self.get_flags().contains(InvocationFlags::SEQUENTIAL)
    }

    pub fn is_log_enabled(&self) -> bool {
        self.log_enabled
    }

    pub fn disable_log(&mut self) {
        self.log_enabled = false;
    }

    //
    // Objects
    //

    pub fn subject_object(&self) -> Option<&Object> {
        self.subject.as_ref()
    }

    pub fn set_subject(&mut self, subject: Option<Object>) {
        self.subject = subject;
    }

    pub fn input_objects(&self) -> &ObjectCollection {
        &self.input_objects
    }

    pub fn get_object(&self, name: &str) -> Option<&Object> {
        self.input_objects.get(name).map(|item| &item.object)
    }

    /// The `n`-th most recently bound object, 1-based
    pub fn get_previous_object(&self, n: usize) -> Option<&Object> {
        self.input_objects.get_previous(n).map(|item| &item.object)
    }

    pub fn push_object(&mut self, name: impl Into<String>, object: Object) {
        self.input_objects.push(name, object);
    }

    /// Store under a user-chosen name, rejecting names the grammar cannot refer to
    pub fn bind_object(&mut self, name: &str, object: Object) -> Result<(), Error> {
        let valid_start = name
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_');
        let valid_chars = name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
        if !valid_start || !valid_chars {
            return Err(Error::BadObjectBindName(name.to_string()));
        }
        self.input_objects.store(name, object);
        Ok(())
    }

    pub fn store_object(&mut self, name: impl Into<String>, object: Object) {
        self.input_objects.store(name, object);
    }

    pub fn remove_object(&mut self, name: &str) -> usize {
        self.input_objects.delete(name)
    }

    //
    // Types
    //

    pub fn get_type(&self, name: &str) -> Result<TypeRef, Error> {
        self.type_module.get(name)
    }

    pub fn select_type(&self, name: &str) -> Option<TypeRef> {
        self.type_module.find(name, None)
    }

    pub fn deduce_type(&self, value: &Value) -> TypeRef {
        self.type_module.deduce(value)
    }

    /// Box a value with its deduced type
    pub fn new_object(&self, value: Value) -> Object {
        Object::new(self.deduce_type(&value), value)
    }

    /// Box a value with a named type whose kind accepts it
    pub fn new_object_of(&self, value: Value, typename: &str) -> Result<Object, Error> {
        let ty = self.get_type(typename)?;
        if !ty.accepts(&value) {
            return Err(Error::TypeError(format!(
                "'{typename}' does not hold {}",
                value.kind().primitive_name()
            )));
        }
        Ok(Object::new(ty, value))
    }

    pub fn new_error_object(&self, error: Error, expression: &str) -> Object {
        let payload = ErrorObject::new(error).with_expression(expression);
        self.new_object(Value::Error(Arc::new(payload)))
    }

    /// The object answering `@#member`
    pub fn root_object(&self) -> Result<Object, Error> {
        Ok(Object::new(self.get_type("RootObject")?, Value::None))
    }

    //
    // Invocations and log
    //

    /// Slot index for the next invocation; sequential contexts reuse the last slot
    pub fn begin_invocation(&mut self) -> usize {
        let index = if self.is_sequential_invocation() && !self.invocations.is_empty() {
            self.invocations.len() - 1
        } else {
            self.invocations.len()
        };
        self.add_log(LogEntry::EvalBegin(index));
        index
    }

    pub fn finish_invocation(&mut self, index: usize, entry: InvocationEntry) {
        if let Some(slot) = self.invocations.get_mut(index) {
            *slot = entry;
        } else {
            self.invocations.push(entry);
        }
        self.add_log(LogEntry::EvalEnd(index));
    }

    pub fn invocations(&self) -> &[InvocationEntry] {
        &self.invocations
    }

    pub fn add_log(&mut self, entry: LogEntry) {
        if self.log_enabled {
            self.log.push(entry);
        }
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Keep a finished fork in the log
    pub fn add_subcontext(&mut self, child: InvocationContext) {
        self.add_log(LogEntry::SubContext(Box::new(child)));
    }

    pub fn get_subcontext_list(&self) -> Vec<&InvocationContext> {
        self.log
            .iter()
            .filter_map(|e| match e {
                LogEntry::SubContext(c) => Some(c.as_ref()),
                _ => None,
            })
            .collect()
    }

    /// Look up a context by hyphenated id: `0` is this context, `0-4` its
    /// fifth fork, `0-4-1` the second fork of that one.
    pub fn get_subcontext(&self, id: &str) -> Option<&InvocationContext> {
        let mut parts = id.split('-');
        if parts.next()? != "0" {
            return None;
        }
        let mut current = self;
        for part in parts {
            let index: usize = part.parse().ok()?;
            current = current.get_subcontext_list().into_iter().nth(index)?;
        }
        Some(current)
    }

    pub fn get_last_result(&self) -> Option<&Object> {
        self.invocations.last().and_then(|e| e.result.as_ref())
    }

    /// Source text of the last evaluated message
    pub fn get_message(&self) -> Option<&str> {
        self.invocations.last().map(|e| e.message.as_str())
    }

    //
    // Exceptions
    //

    pub fn push_extra_exception(&mut self, error: Error) {
        tracing::debug!(error = %error, "extra exception");
        self.extra_exception = Some(error);
    }

    pub fn pop_exception(&mut self) -> Option<Error> {
        self.extra_exception.take()
    }

    /// The extra exception, else the failure of the last invocation
    pub fn get_last_exception(&self) -> Option<&Error> {
        self.extra_exception
            .as_ref()
            .or_else(|| self.invocations.last().and_then(|e| e.exception.as_ref()))
    }

    pub fn is_failed(&self) -> bool {
        self.get_last_exception().is_some()
    }

    /// Ids and errors of every failed context in the tree
    pub fn get_errors(&self) -> Vec<(String, Error)> {
        let mut errors = Vec::new();
        self.collect_errors("0", &mut errors);
        errors
    }

    fn collect_errors(&self, id: &str, errors: &mut Vec<(String, Error)>) {
        if let Some(e) = self.get_last_exception() {
            errors.push((id.to_string(), e.clone()));
        }
        for (i, child) in self.get_subcontext_list().into_iter().enumerate() {
            child.collect_errors(&format!("{id}-{i}"), errors);
        }
    }

    /// Render the log tree as text
    pub fn display_log(&self) -> String {
        LogTree { ctx: self, level: 0 }.to_string()
    }

    fn write_log(&self, f: &mut fmt::Formatter<'_>, level: usize) -> fmt::Result {
        let indent = "  ".repeat(level);
        for entry in &self.log {
            match entry {
                LogEntry::MessageBegin => writeln!(f, "{indent}message:")?,
                LogEntry::Code(code) => writeln!(f, "{indent}  | {code}")?,
                LogEntry::EvalBegin(i) => match self.invocations.get(*i) {
                    Some(inv) => {
                        let args: Vec<String> = inv.args.iter().map(|a| format!("{a:?}")).collect();
                        writeln!(f, "{indent}  #{i} {} [{}]", inv.invocation, args.join(", "))?;
                    }
                    None => writeln!(f, "{indent}  #{i}")?,
                },
                LogEntry::EvalEnd(i) => match self.invocations.get(*i).map(|inv| (&inv.exception, &inv.result)) {
                    Some((Some(e), _)) => writeln!(f, "{indent}  #{i} ! {e}")?,
                    Some((None, Some(r))) => writeln!(f, "{indent}  #{i} -> {r:?}")?,
                    Some((None, None)) | None => writeln!(f, "{indent}  #{i} -> (none)")?,
                },
                LogEntry::MessageEnd => writeln!(f, "{indent}end")?,
                LogEntry::SubContext(child) => {
                    writeln!(f, "{indent}  context (depth {}):", child.depth)?;
                    child.write_log(f, level + 2)?;
                }
            }
        }
        Ok(())
    }

    /// Post the rendered log to the spirit, one line per post
    pub fn pprint_log(&self) {
        for line in self.display_log().lines() {
            self.spirit.post("message", line);
        }
    }
}

/// Indented view of a context log and its subcontexts
struct LogTree<'a> {
    ctx: &'a InvocationContext,
    level: usize,
}

impl fmt::Display for LogTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ctx.write_log(f, self.level)
    }
}

/// Builder for top-level contexts
#[derive(Debug)]
pub struct ContextBuilder {
    type_module: Option<Arc<TypeModule>>,
    input_objects: ObjectCollection,
    subject: Option<Object>,
    spirit: Option<Arc<dyn Spirit>>,
    flags: InvocationFlags,
    log: bool,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        ContextBuilder {
            type_module: None,
            input_objects: ObjectCollection::new(),
            subject: None,
            spirit: None,
            flags: InvocationFlags::empty(),
            log: true,
        }
    }

    pub fn type_module(mut self, module: Arc<TypeModule>) -> Self {
        self.type_module = Some(module);
        self
    }

    pub fn input_objects(mut self, objects: ObjectCollection) -> Self {
        self.input_objects = objects;
        self
    }

    pub fn subject(mut self, subject: Object) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn spirit(mut self, spirit: Arc<dyn Spirit>) -> Self {
        self.spirit = Some(spirit);
        self
    }

    pub fn flags(mut self, flags: InvocationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn log(mut self, enabled: bool) -> Self {
        self.log = enabled;
        self
    }

    pub fn build(self) -> InvocationContext {
        InvocationContext {
            type_module: self
                .type_module
                .unwrap_or_else(crate::fundamental::fundamental_module),
            input_objects: self.input_objects,
            subject: self.subject,
            spirit: self.spirit.unwrap_or_else(|| Arc::new(TempSpirit::new())),
            flags: self.flags.bits(),
            invocations: Vec::new(),
            log: Vec::new(),
            log_enabled: self.log,
            extra_exception: None,
            depth: 0,
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    #[test]
    fn test_flag_inheritance() {
        let mut ctx = InvocationContext::instant(None);
        ctx.set_flags(InvocationFlags::PRINT_STEP, FlagScope::Now);
        ctx.set_flags(InvocationFlags::RAISE_ERROR, FlagScope::InheritSet);
        assert!(ctx.is_set_print_step());
        assert!(!ctx.is_set_raise_error());

        let child = ctx.inherit(None);
        assert!(child.is_set_print_step());
        assert!(child.is_set_raise_error());
        assert_eq!(child.get_depth(), 1);

        ctx.set_flags(InvocationFlags::PRINT_STEP, FlagScope::InheritRemove);
        let child = ctx.inherit(None);
        assert!(!child.is_set_print_step());
        // inherit bits are not passed further down
        let grandchild = child.inherit(None);
        assert!(grandchild.is_set_raise_error());

        let seq = ctx.inherit_sequential();
        assert!(seq.is_sequential_invocation());
        assert!(seq.is_set_raise_error());
        assert!(!seq.is_set_print_step());
        assert!(!seq.is_log_enabled());
    }

    #[test]
    fn test_bind_names() {
        let mut ctx = InvocationContext::instant(None);
        let obj = ctx.new_object(Value::Int(1));
        for good in ["lucky", "_tmp", "a-b", "x1"] {
            assert!(ctx.bind_object(good, obj.clone()).is_ok(), "{good}");
        }
        for bad in ["", "1x", "a b", "@x", "-a"] {
            assert_eq!(
                ctx.bind_object(bad, obj.clone()).err().unwrap().kind_name(),
                "BadObjectBindName",
                "{bad}"
            );
        }
        assert_eq!(ctx.get_object("lucky").unwrap().value(), &Value::Int(1));
        assert_eq!(ctx.get_previous_object(1).unwrap().value(), &Value::Int(1));
        assert_eq!(ctx.remove_object("lucky"), 1);
        assert!(ctx.get_object("lucky").is_none());
    }

    #[test]
    fn test_fork_isolation() {
        let mut ctx = InvocationContext::instant(None);
        ctx.push_object("a", ctx.new_object(Value::Int(1)));
        let mut child = ctx.inherit(None);
        child.store_object("a", child.new_object(Value::Int(2)));
        child.push_object("b", child.new_object(Value::Int(3)));
        child.set_flags(InvocationFlags::RAISE_ERROR, FlagScope::Now);
        assert_eq!(child.get_object("a").unwrap().value(), &Value::Int(2));
        ctx.add_subcontext(child);

        assert_eq!(ctx.get_object("a").unwrap().value(), &Value::Int(1));
        assert!(ctx.get_object("b").is_none());
        assert!(!ctx.is_set_raise_error());
    }

    #[test]
    fn test_subcontext_ids_and_errors() {
        let mut root = InvocationContext::instant(None);
        let first = root.inherit(None);
        let mut second = root.inherit(None);
        let mut nested = second.inherit(None);
        nested.push_extra_exception(Error::ZeroDivision);
        second.add_subcontext(nested);
        root.add_subcontext(first);
        root.add_subcontext(second);

        assert_eq!(root.get_subcontext_list().len(), 2);
        assert_eq!(root.get_subcontext("0").unwrap().get_depth(), 0);
        assert_eq!(root.get_subcontext("0-1-0").unwrap().get_depth(), 2);
        assert!(root.get_subcontext("0-2").is_none());
        assert!(root.get_subcontext("1").is_none());

        let errors = root.get_errors();
        assert_eq!(errors, vec![("0-1-0".to_string(), Error::ZeroDivision)]);
        assert!(root.display_log().contains("context (depth 2)"));
    }

    #[test]
    fn test_display_log_renders_nested_runs() {
        let mut root = InvocationContext::instant(None);
        let subject = root.new_object(Value::Int(0));
        let result = crate::MessageEngine::new("1 / @").run(Some(subject), &mut root, false).unwrap();
        assert!(result.is_error());

        let log = root.display_log();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.first(), Some(&"  context (depth 1):"), "{log}");
        assert!(lines.contains(&"    message:"), "{log}");
        assert!(lines.contains(&"      #0 ! ZeroDivisionError: division by zero"), "{log}");
        assert!(lines.iter().all(|l| l.starts_with("  ")), "{log}");
    }

    #[test]
    fn test_extra_exception() {
        let mut ctx = InvocationContext::instant(None);
        assert!(!ctx.is_failed());
        ctx.push_extra_exception(Error::ValueError("bad".into()));
        assert_eq!(ctx.get_last_exception().unwrap().kind_name(), "ValueError");
        assert!(ctx.pop_exception().is_some());
        assert!(!ctx.is_failed());
    }

    #[test]
    fn test_spirit_posts_and_interrupt() {
        let spirit = Arc::new(TempSpirit::new());
        let ctx = InvocationContext::builder().spirit(spirit.clone()).build();
        ctx.post("message", "hello");
        assert_eq!(spirit.messages(), vec!["hello".to_string()]);
        assert!(ctx.check_interruption().is_ok());
        spirit.interrupt();
        assert_eq!(ctx.check_interruption(), Err(Interrupted));
    }
}
