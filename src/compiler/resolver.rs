// MathVM scope resolver
// Maps names to (context, slot) addresses and tracks function signatures per scope

use super::code::VarType;
use crate::error::{ErrorKind, Span, TranslationError};
use rustc_hash::FxHashMap;

/// Resolved address and type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInfo {
    pub ty: VarType,
    pub context: u16,
    pub slot: u16,
}

/// Signature of a function visible in some scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub id: u16,
    pub params: Vec<VarType>,
    pub return_type: VarType,
    /// Native id for `native` declarations
    pub native: Option<u16>,
}

#[derive(Debug)]
struct Scope {
    id: u16,
    parent: Option<usize>,
    context: u16,
    vars: FxHashMap<String, VarInfo>,
    /// Declaration order, for listing top-level variables
    order: Vec<String>,
    functions: FxHashMap<String, FunctionInfo>,
}

#[derive(Debug)]
struct ContextState {
    id: u16,
    next_slot: u32,
}

#[derive(Debug, Default)]
pub struct ScopeResolver {
    /// Scope arena; parents are indices into it
    scopes: Vec<Scope>,
    current: Option<usize>,
    contexts: Vec<ContextState>,
    next_context: u32,
}

impl ScopeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context of the innermost open scope
    pub fn current_context(&self) -> u16 {
        self.contexts.last().map(|c| c.id).unwrap_or(0)
    }

    /// Open a function activation: fresh context id and a fresh top scope
    pub fn push_context(&mut self, span: Span) -> Result<u16, TranslationError> {
        let id = u16::try_from(self.next_context).map_err(|_| TranslationError::limit("contexts", span))?;
        self.next_context += 1;
        self.contexts.push(ContextState { id, next_slot: 0 });
        self.push_scope(span)?;
        Ok(id)
    }

    /// Close the current context; returns the number of slots it used
    pub fn pop_context(&mut self) -> u16 {
        self.pop_scope();
        self.contexts
            .pop()
            .map(|c| c.next_slot as u16)
            .unwrap_or(0)
    }

    /// Open a nested scope in the current context
    pub fn push_scope(&mut self, span: Span) -> Result<(), TranslationError> {
        let id = u16::try_from(self.scopes.len()).map_err(|_| TranslationError::limit("scopes", span))?;
        self.scopes.push(Scope {
            id,
            parent: self.current,
            context: self.current_context(),
            vars: FxHashMap::default(),
            order: Vec::new(),
            functions: FxHashMap::default(),
        });
        self.current = Some(self.scopes.len() - 1);
        Ok(())
    }

    pub fn pop_scope(&mut self) {
        if let Some(idx) = self.current {
            self.current = self.scopes[idx].parent;
        }
    }

    pub fn current_scope_id(&self) -> Option<u16> {
        self.current.map(|idx| self.scopes[idx].id)
    }

    fn allocate_slot(&mut self, span: Span) -> Result<u16, TranslationError> {
        let ctx = self
            .contexts
            .last_mut()
            .ok_or_else(|| TranslationError::syntax("Declaration outside of any function", span))?;
        if ctx.next_slot >= u16::MAX as u32 {
            return Err(TranslationError::limit("local variables", span));
        }
        let slot = ctx.next_slot as u16;
        ctx.next_slot += 1;
        Ok(slot)
    }

    pub fn declare_var(
        &mut self,
        name: &str,
        ty: VarType,
        span: Span,
    ) -> Result<VarInfo, TranslationError> {
        let idx = self.current.ok_or_else(|| TranslationError::syntax("No open scope", span))?;
        if self.scopes[idx].vars.contains_key(name) {
            return Err(TranslationError::new(
                ErrorKind::DuplicateVariable,
                format!("Variable '{}' already declared in this scope", name),
                span,
            ));
        }
        let slot = self.allocate_slot(span)?;
        let scope = &mut self.scopes[idx];
        let info = VarInfo {
            ty,
            context: scope.context,
            slot,
        };
        scope.vars.insert(name.to_string(), info);
        scope.order.push(name.to_string());
        Ok(info)
    }

    /// Anonymous slot in the current context
    pub fn declare_hidden(&mut self, ty: VarType, span: Span) -> Result<VarInfo, TranslationError> {
        let slot = self.allocate_slot(span)?;
        Ok(VarInfo {
            ty,
            context: self.current_context(),
            slot,
        })
    }

    /// Innermost visible variable called `name`
    pub fn lookup_var(&self, name: &str) -> Option<VarInfo> {
        let mut scope = self.current;
        while let Some(idx) = scope {
            if let Some(info) = self.scopes[idx].vars.get(name) {
                return Some(*info);
            }
            scope = self.scopes[idx].parent;
        }
        None
    }

    pub fn declare_function(
        &mut self,
        name: &str,
        info: FunctionInfo,
        span: Span,
    ) -> Result<(), TranslationError> {
        let idx = self.current.ok_or_else(|| TranslationError::syntax("No open scope", span))?;
        let functions = &mut self.scopes[idx].functions;
        if functions.contains_key(name) {
            return Err(TranslationError::new(
                ErrorKind::DuplicateFunction,
                format!("Function '{}' already declared in this scope", name),
                span,
            ));
        }
        functions.insert(name.to_string(), info);
        Ok(())
    }

    pub fn lookup_function(&self, name: &str) -> Option<&FunctionInfo> {
        let mut scope = self.current;
        while let Some(idx) = scope {
            if let Some(info) = self.scopes[idx].functions.get(name) {
                return Some(info);
            }
            scope = self.scopes[idx].parent;
        }
        None
    }

    /// Variables of the outermost scope in declaration order
    pub fn top_level_vars(&self) -> Vec<(String, VarInfo)> {
        match self.scopes.first() {
            Some(scope) => scope
                .order
                .iter()
                .filter_map(|name| scope.vars.get(name).map(|info| (name.clone(), *info)))
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> Span {
        Span::default()
    }

    #[test]
    fn test_slots_are_monotonic_within_context() {
        let mut r = ScopeResolver::new();
        let ctx = r.push_context(span()).unwrap();
        assert_eq!(ctx, 0);
        let a = r.declare_var("a", VarType::Int, span()).unwrap();
        r.push_scope(span()).unwrap();
        let b = r.declare_var("b", VarType::Double, span()).unwrap();
        r.pop_scope();
        r.push_scope(span()).unwrap();
        let c = r.declare_var("c", VarType::String, span()).unwrap();
        r.pop_scope();
        assert_eq!((a.slot, b.slot, c.slot), (0, 1, 2));
        assert_eq!(r.pop_context(), 3);
    }

    #[test]
    fn test_lookup_walks_outward_and_shadows() {
        let mut r = ScopeResolver::new();
        r.push_context(span()).unwrap();
        r.declare_var("x", VarType::Int, span()).unwrap();
        let ctx = r.push_context(span()).unwrap();
        assert_eq!(ctx, 1);
        let outer = r.lookup_var("x").unwrap();
        assert_eq!(outer.context, 0);
        r.declare_var("x", VarType::Double, span()).unwrap();
        let inner = r.lookup_var("x").unwrap();
        assert_eq!((inner.context, inner.ty), (1, VarType::Double));
        r.pop_context();
        assert_eq!(r.lookup_var("x").unwrap().ty, VarType::Int);
        assert!(r.lookup_var("nope").is_none());
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut r = ScopeResolver::new();
        r.push_context(span()).unwrap();
        r.declare_var("x", VarType::Int, span()).unwrap();
        let err = r.declare_var("x", VarType::Int, span()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateVariable);

        let info = FunctionInfo {
            id: 1,
            params: vec![],
            return_type: VarType::Void,
            native: None,
        };
        r.declare_function("f", info.clone(), span()).unwrap();
        let err = r.declare_function("f", info, span()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateFunction);
    }

    #[test]
    fn test_slot_and_scope_limits() {
        let mut r = ScopeResolver::new();
        r.push_context(span()).unwrap();
        for i in 0..u16::MAX {
            r.declare_var(&format!("v{}", i), VarType::Int, span()).unwrap();
        }
        let err = r.declare_var("one_more", VarType::Int, span()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LimitExceeded);
        assert_eq!(
            r.declare_hidden(VarType::Int, span()).unwrap_err().kind,
            ErrorKind::LimitExceeded
        );

        // push_context already opened scope 0
        for _ in 1..=u16::MAX {
            r.push_scope(span()).unwrap();
        }
        assert_eq!(r.push_scope(span()).unwrap_err().kind, ErrorKind::LimitExceeded);
    }

    #[test]
    fn test_top_level_vars_in_order() {
        let mut r = ScopeResolver::new();
        r.push_context(span()).unwrap();
        r.declare_var("b", VarType::Int, span()).unwrap();
        r.declare_var("a", VarType::String, span()).unwrap();
        r.declare_hidden(VarType::Int, span()).unwrap();
        let vars = r.top_level_vars();
        assert_eq!(vars[0].0, "b");
        assert_eq!(vars[1].0, "a");
        assert_eq!(vars[1].1.slot, 1);
        assert_eq!(vars.len(), 2);
    }
}
