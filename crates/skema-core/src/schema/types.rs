// AST for the schema language. Every node carries the source range it was
// parsed from; trees are immutable after parsing (the rewriter mutates
// name/path fields in place on a tree it is about to serialize and discard).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Index {
    /// 0-indexed byte offset into the source.
    pub offset: usize,
    /// 1-indexed.
    pub line: usize,
    /// 1-indexed.
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRange {
    pub start: Index,
    pub end: Index,
}

impl TextRange {
    pub fn contains(&self, line: usize, column: usize) -> bool {
        if line < self.start.line || line > self.end.line {
            return false;
        }
        if line == self.start.line && column < self.start.column {
            return false;
        }
        if line == self.end.line && column > self.end.column {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub source: String,
    pub definitions: Vec<TopLevelDefinition>,
}

impl Schema {
    pub fn object_definitions(&self) -> impl Iterator<Item = &ObjectDefinition> {
        self.definitions.iter().filter_map(|d| match d {
            TopLevelDefinition::Object(def) => Some(def),
            _ => None,
        })
    }

    pub fn caveat_definitions(&self) -> impl Iterator<Item = &CaveatDefinition> {
        self.definitions.iter().filter_map(|d| match d {
            TopLevelDefinition::Caveat(def) => Some(def),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopLevelDefinition {
    Use(UseFlag),
    Caveat(CaveatDefinition),
    Object(ObjectDefinition),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseFlag {
    pub feature_name: String,
    pub range: TextRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaveatDefinition {
    pub name: String,
    pub parameters: Vec<CaveatParameter>,
    pub expression: CaveatExpression,
    pub range: TextRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaveatParameter {
    pub name: String,
    pub param_type: CaveatParameterTypeRef,
    pub range: TextRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaveatParameterTypeRef {
    pub name: String,
    pub generics: Vec<CaveatParameterTypeRef>,
    pub range: TextRange,
}

// Opaque to the resolver: only the range is exposed, never an inner tree.
// The body text is recovered by slicing `Schema::source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaveatExpression {
    pub range: TextRange,
}

impl CaveatExpression {
    // `source` must be the owning `Schema::source`; a string the range does
    // not fit yields an empty slice, never a panic.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        source
            .get(self.range.start.offset..self.range.end.offset)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDefinition {
    pub name: String,
    pub relations: Vec<Relation>,
    pub permissions: Vec<Permission>,
    pub range: TextRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    pub allowed_types: TypeExpr,
    pub range: TextRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub name: String,
    pub expr: Expression,
    pub range: TextRange,
}

// Pipe-separated alternatives; never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeExpr {
    pub types: Vec<TypeRef>,
    pub range: TextRange,
}

// `wildcard` and `subject_relation` are mutually exclusive by grammar
// construction; `caveat` and `expiration` are independent qualifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    pub path: String,
    pub subject_relation: Option<String>,
    pub wildcard: bool,
    pub caveat: Option<WithCaveat>,
    pub expiration: bool,
    pub range: TextRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithCaveat {
    pub path: String,
    pub range: TextRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Union,
    Intersection,
    Exclusion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRefExpression {
    pub relation_name: String,
    pub range: TextRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Binary {
        operator: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
        range: TextRange,
    },
    RelationRef(RelationRefExpression),
    Arrow {
        source: RelationRefExpression,
        target: String,
        range: TextRange,
    },
    NamedArrow {
        source: RelationRefExpression,
        function_name: String,
        target: String,
        range: TextRange,
    },
    Nil {
        range: TextRange,
    },
}

impl Expression {
    pub fn range(&self) -> TextRange {
        match self {
            Expression::Binary { range, .. } => *range,
            Expression::RelationRef(r) => r.range,
            Expression::Arrow { range, .. } => *range,
            Expression::NamedArrow { range, .. } => *range,
            Expression::Nil { range } => *range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(offset: usize, line: usize, column: usize) -> Index {
        Index {
            offset,
            line,
            column,
        }
    }

    #[test]
    fn caveat_expression_text_tolerates_mismatched_source() {
        let expression = CaveatExpression {
            range: TextRange {
                start: index(24, 2, 2),
                end: index(42, 2, 20),
            },
        };

        assert_eq!(expression.text("too short"), "");
    }

    #[test]
    fn single_line_range_containment() {
        let range = TextRange {
            start: index(10, 1, 11),
            end: index(14, 1, 15),
        };

        assert!(range.contains(1, 11));
        assert!(range.contains(1, 13));
        assert!(range.contains(1, 15));
        assert!(!range.contains(1, 10));
        assert!(!range.contains(1, 16));
        assert!(!range.contains(2, 13));
    }

    #[test]
    fn multi_line_range_containment() {
        let range = TextRange {
            start: index(5, 2, 3),
            end: index(40, 4, 6),
        };

        assert!(range.contains(2, 3));
        assert!(range.contains(3, 1));
        assert!(range.contains(3, 999));
        assert!(range.contains(4, 6));
        assert!(!range.contains(2, 2));
        assert!(!range.contains(4, 7));
        assert!(!range.contains(1, 3));
        assert!(!range.contains(5, 1));
    }
}
