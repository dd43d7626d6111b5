//! ReQL term type catalog.
//!
//! Every query operation is identified on the wire by a numeric term code.
//! The catalog below is pure data: adding an operator means adding a row, no
//! new control flow anywhere in the driver. The generic tree machinery in
//! [`crate::reql::ast`] is independent of which rows exist.

use serde::{Deserialize, Serialize};

macro_rules! term_types {
    ($($variant:ident = $code:literal => $name:literal,)+) => {
        /// One ReQL operator kind, with its numeric wire code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u64)]
        pub enum TermType {
            $($variant = $code,)+
        }

        impl TermType {
            /// Look up a term type from its wire code.
            pub fn from_wire(value: u64) -> Option<Self> {
                match value {
                    $($code => Some(TermType::$variant),)+
                    _ => None,
                }
            }

            /// The numeric code used in the wire encoding.
            pub fn wire_code(self) -> u64 {
                self as u64
            }

            /// Uppercase protocol name, for logs and error messages.
            pub fn name(self) -> &'static str {
                match self {
                    $(TermType::$variant => $name,)+
                }
            }
        }
    };
}

term_types! {
    // Core data types
    Datum = 0 => "DATUM",
    MakeArray = 1 => "MAKE_ARRAY",
    MakeObj = 2 => "MAKE_OBJ",

    // Variables
    Var = 3 => "VAR",

    // JavaScript evaluation
    Javascript = 4 => "JAVASCRIPT",

    // Database operations
    Db = 9 => "DB",
    Table = 10 => "TABLE",
    Get = 11 => "GET",
    GetAll = 12 => "GET_ALL",

    // Comparison operators
    Eq = 13 => "EQ",
    Ne = 14 => "NE",
    Lt = 15 => "LT",
    Le = 16 => "LE",
    Gt = 17 => "GT",
    Ge = 18 => "GE",

    // Logic operators
    Not = 19 => "NOT",

    // Math operators
    Add = 20 => "ADD",
    Sub = 21 => "SUB",
    Mul = 22 => "MUL",
    Div = 23 => "DIV",
    Mod = 24 => "MOD",

    // Array/Set operations
    Append = 28 => "APPEND",
    Prepend = 29 => "PREPEND",
    Difference = 30 => "DIFFERENCE",
    SetInsert = 31 => "SET_INSERT",
    SetIntersection = 32 => "SET_INTERSECTION",
    SetUnion = 33 => "SET_UNION",
    SetDifference = 34 => "SET_DIFFERENCE",

    // Sequence operations
    Slice = 35 => "SLICE",
    Skip = 36 => "SKIP",
    Limit = 37 => "LIMIT",
    Contains = 39 => "CONTAINS",

    // Object operations
    GetField = 40 => "GET_FIELD",
    Keys = 41 => "KEYS",
    Values = 42 => "VALUES",
    HasFields = 44 => "HAS_FIELDS",
    Pluck = 46 => "PLUCK",
    Without = 47 => "WITHOUT",
    Merge = 48 => "MERGE",

    // Data access
    Between = 49 => "BETWEEN",

    // Aggregations & transformations
    Reduce = 50 => "REDUCE",
    Map = 51 => "MAP",
    Filter = 53 => "FILTER",
    ConcatMap = 54 => "CONCAT_MAP",
    OrderBy = 55 => "ORDER_BY",
    Distinct = 56 => "DISTINCT",
    Count = 57 => "COUNT",
    Nth = 60 => "NTH",

    // Array mutations
    InsertAt = 67 => "INSERT_AT",
    DeleteAt = 68 => "DELETE_AT",
    ChangeAt = 69 => "CHANGE_AT",
    SpliceAt = 70 => "SPLICE_AT",

    // Type operations
    CoerceTo = 71 => "COERCE_TO",
    TypeOf = 72 => "TYPE_OF",

    // Write operations
    Update = 73 => "UPDATE",
    Delete = 74 => "DELETE",
    Replace = 75 => "REPLACE",
    Insert = 76 => "INSERT",

    // Database admin
    DbCreate = 77 => "DB_CREATE",
    DbDrop = 78 => "DB_DROP",
    DbList = 79 => "DB_LIST",

    // Table admin
    TableCreate = 80 => "TABLE_CREATE",
    TableDrop = 81 => "TABLE_DROP",
    TableList = 82 => "TABLE_LIST",

    // Control flow
    Branch = 99 => "BRANCH",
    Or = 100 => "OR",
    And = 101 => "AND",
    ForEach = 102 => "FOR_EACH",
    Func = 103 => "FUNC",

    // Grouping & aggregations
    Group = 152 => "GROUP",
    Sum = 153 => "SUM",
    Avg = 154 => "AVG",
    Min = 155 => "MIN",
    Max = 156 => "MAX",
}

impl std::fmt::Display for TermType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
