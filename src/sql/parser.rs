//! Parser for the supported SQL fragment, built from nom combinators.
//!
//! Keywords are case-insensitive; identifiers are case-sensitive and
//! unquoted.  The grammar is deliberately small: `CREATE TABLE`,
//! `CREATE VIEW ... AS SELECT` with one optional join, WHERE, GROUP
//! BY/HAVING, ORDER BY/LIMIT, and UNION [ALL].

use crate::{
    data::Value,
    error::ParseError,
    sql::ast::{
        AggFunc, BinaryOp, ColumnDef, ColumnRef, CreateTable, CreateView, Expr, JoinClause,
        JoinKind, OrderKey, Query, ScalarFunc, Select, SelectItem, SetExpr, SqlType, Statement,
        TableRef, UnaryOp,
    },
};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0},
    combinator::{map, opt, recognize, value},
    error::{Error as NomError, ErrorKind},
    multi::{many0, many1, separated_list1},
    sequence::{delimited, pair, preceded, tuple},
    Err as NomErr, IResult,
};
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Words that can never be identifiers.
static RESERVED: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "CREATE", "TABLE", "VIEW", "AS", "SELECT", "FROM", "WHERE", "GROUP", "BY", "HAVING",
        "ORDER", "LIMIT", "UNION", "ALL", "AND", "OR", "NOT", "NULL", "TRUE", "FALSE", "IS", "IN",
        "BETWEEN", "LIKE", "CASE", "WHEN", "THEN", "ELSE", "END", "CAST", "JOIN", "INNER", "LEFT",
        "RIGHT", "OUTER", "CROSS", "ON", "ASC", "DESC", "PRIMARY", "KEY",
    ]
    .into_iter()
    .collect()
});

/// Parse a complete statement list; the whole input must be consumed.
pub fn parse_statements(input: &str) -> Result<Vec<Statement>, ParseError> {
    let mut statements = Vec::new();
    let mut rest = skip_separators(input);
    while !rest.is_empty() {
        match statement(rest) {
            Ok((after, stmt)) => {
                statements.push(stmt);
                let after = after.trim_start();
                if let Some(stripped) = after.strip_prefix(';') {
                    rest = skip_separators(stripped);
                } else if after.is_empty() {
                    rest = after;
                } else {
                    return Err(ParseError::Trailing(near(after)));
                }
            }
            Err(_) => return Err(ParseError::Syntax { near: near(rest) }),
        }
    }
    Ok(statements)
}

fn skip_separators(input: &str) -> &str {
    let mut rest = input.trim_start();
    while let Some(stripped) = rest.strip_prefix(';') {
        rest = stripped.trim_start();
    }
    rest
}

fn near(input: &str) -> String {
    input.trim_start().chars().take(32).collect()
}

fn error(input: &str) -> NomErr<NomError<&str>> {
    NomErr::Error(NomError::new(input, ErrorKind::Tag))
}

fn sym<'a>(s: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    preceded(multispace0, tag(s))
}

/// Case-insensitive keyword that must not be followed by an identifier
/// character.
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input: &'a str| {
        let (rest, word) = preceded(multispace0, tag_no_case(kw))(input)?;
        match rest.chars().next() {
            Some(c) if c.is_alphanumeric() || c == '_' => Err(error(input)),
            _ => Ok((rest, word)),
        }
    }
}

fn identifier(input: &str) -> IResult<&str, String> {
    let (rest, ident) = preceded(
        multispace0,
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0(alt((alphanumeric1, tag("_")))),
        )),
    )(input)?;
    if RESERVED.contains(ident.to_ascii_uppercase().as_str()) {
        Err(error(input))
    } else {
        Ok((rest, ident.to_owned()))
    }
}

fn number(input: &str) -> IResult<&str, Value> {
    let (rest, text) = preceded(
        multispace0,
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
    )(input)?;
    let value = if text.contains('.') {
        match text.parse::<f64>() {
            Ok(d) => Value::double(d),
            Err(_) => return Err(error(input)),
        }
    } else {
        match text.parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => return Err(error(input)),
        }
    };
    Ok((rest, value))
}

/// Single-quoted string; `''` escapes a quote.
fn string_literal(input: &str) -> IResult<&str, String> {
    let (input, _) = preceded(multispace0, char('\''))(input)?;
    let mut out = String::new();
    let mut rest = input;
    loop {
        match rest.find('\'') {
            None => return Err(error(rest)),
            Some(pos) => {
                out.push_str(&rest[..pos]);
                let after = &rest[pos + 1..];
                if let Some(stripped) = after.strip_prefix('\'') {
                    out.push('\'');
                    rest = stripped;
                } else {
                    return Ok((after, out));
                }
            }
        }
    }
}

fn literal(input: &str) -> IResult<&str, Expr> {
    alt((
        value(Expr::Literal(Value::Null), keyword("NULL")),
        value(Expr::Literal(Value::Bool(true)), keyword("TRUE")),
        value(Expr::Literal(Value::Bool(false)), keyword("FALSE")),
        map(number, Expr::Literal),
        map(string_literal, |s| Expr::Literal(Value::Text(s))),
    ))(input)
}

fn sql_type(input: &str) -> IResult<&str, SqlType> {
    let (input, ty) = alt((
        value(
            SqlType::Integer,
            alt((keyword("INTEGER"), keyword("BIGINT"), keyword("INT"))),
        ),
        value(
            SqlType::Double,
            alt((
                map(pair(keyword("DOUBLE"), opt(keyword("PRECISION"))), |_| ""),
                keyword("REAL"),
                keyword("FLOAT"),
            )),
        ),
        value(
            SqlType::Text,
            alt((keyword("TEXT"), keyword("VARCHAR"), keyword("CHAR"))),
        ),
        value(SqlType::Boolean, alt((keyword("BOOLEAN"), keyword("BOOL")))),
    ))(input)?;
    // A length such as VARCHAR(255) parses but is not enforced.
    let (input, _) = opt(delimited(sym("("), preceded(multispace0, digit1), sym(")")))(input)?;
    Ok((input, ty))
}

fn column_ref(input: &str) -> IResult<&str, ColumnRef> {
    map(
        pair(identifier, opt(preceded(sym("."), identifier))),
        |(first, second)| match second {
            Some(column) => ColumnRef {
                table: Some(first),
                column,
            },
            None => ColumnRef {
                table: None,
                column: first,
            },
        },
    )(input)
}

// Expression grammar, loosest binding first:
// OR < AND < NOT < predicates/comparisons < + - < * / < unary - < atoms.

pub(crate) fn expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(keyword("OR"), and_expr))(input)?;
    Ok((input, fold_binary(BinaryOp::Or, first, rest)))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = not_expr(input)?;
    let (input, rest) = many0(preceded(keyword("AND"), not_expr))(input)?;
    Ok((input, fold_binary(BinaryOp::And, first, rest)))
}

fn fold_binary(op: BinaryOp, first: Expr, rest: Vec<Expr>) -> Expr {
    rest.into_iter().fold(first, |left, right| Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

fn not_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(keyword("NOT"), not_expr), |inner| Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(inner),
        }),
        predicate,
    ))(input)
}

fn comparison_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        value(BinaryOp::NotEq, sym("!=")),
        value(BinaryOp::NotEq, sym("<>")),
        value(BinaryOp::LtEq, sym("<=")),
        value(BinaryOp::GtEq, sym(">=")),
        value(BinaryOp::Eq, sym("=")),
        value(BinaryOp::Lt, sym("<")),
        value(BinaryOp::Gt, sym(">")),
    ))(input)
}

fn predicate(input: &str) -> IResult<&str, Expr> {
    let (input, base) = additive(input)?;

    if let Ok((rest, _)) = keyword("IS")(input) {
        let (rest, negated) = opt(keyword("NOT"))(rest)?;
        let (rest, _) = keyword("NULL")(rest)?;
        return Ok((
            rest,
            Expr::IsNull {
                expr: Box::new(base),
                negated: negated.is_some(),
            },
        ));
    }

    let (after_not, not_kw) = opt(keyword("NOT"))(input)?;
    let negated = not_kw.is_some();

    if let Ok((rest, _)) = keyword("BETWEEN")(after_not) {
        let (rest, low) = additive(rest)?;
        let (rest, _) = keyword("AND")(rest)?;
        let (rest, high) = additive(rest)?;
        return Ok((
            rest,
            Expr::Between {
                expr: Box::new(base),
                low: Box::new(low),
                high: Box::new(high),
                negated,
            },
        ));
    }

    if let Ok((rest, _)) = keyword("IN")(after_not) {
        let (rest, list) =
            delimited(sym("("), separated_list1(sym(","), expr), sym(")"))(rest)?;
        return Ok((
            rest,
            Expr::InList {
                expr: Box::new(base),
                list,
                negated,
            },
        ));
    }

    if let Ok((rest, _)) = keyword("LIKE")(after_not) {
        let (rest, pattern) = string_literal(rest)?;
        return Ok((
            rest,
            Expr::Like {
                expr: Box::new(base),
                pattern,
                negated,
            },
        ));
    }

    if negated {
        return Err(error(input));
    }

    if let Ok((rest, op)) = comparison_op(input) {
        let (rest, right) = additive(rest)?;
        return Ok((
            rest,
            Expr::Binary {
                op,
                left: Box::new(base),
                right: Box::new(right),
            },
        ));
    }

    Ok((input, base))
}

fn additive(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut acc) = multiplicative(input)?;
    loop {
        let op = if let Ok((rest, _)) = sym("+")(input) {
            input = rest;
            BinaryOp::Add
        } else if let Ok((rest, _)) = sym("-")(input) {
            input = rest;
            BinaryOp::Sub
        } else {
            return Ok((input, acc));
        };
        let (rest, rhs) = multiplicative(input)?;
        input = rest;
        acc = Expr::Binary {
            op,
            left: Box::new(acc),
            right: Box::new(rhs),
        };
    }
}

fn multiplicative(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut acc) = unary(input)?;
    loop {
        let op = if let Ok((rest, _)) = sym("*")(input) {
            input = rest;
            BinaryOp::Mul
        } else if let Ok((rest, _)) = sym("/")(input) {
            input = rest;
            BinaryOp::Div
        } else {
            return Ok((input, acc));
        };
        let (rest, rhs) = unary(input)?;
        input = rest;
        acc = Expr::Binary {
            op,
            left: Box::new(acc),
            right: Box::new(rhs),
        };
    }
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(sym("-"), unary), |inner| Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(inner),
        }),
        primary,
    ))(input)
}

fn primary(input: &str) -> IResult<&str, Expr> {
    alt((
        literal,
        case_expr,
        cast_expr,
        agg_call,
        scalar_call,
        map(column_ref, Expr::Column),
        delimited(sym("("), expr, sym(")")),
    ))(input)
}

fn case_expr(input: &str) -> IResult<&str, Expr> {
    let (input, _) = keyword("CASE")(input)?;
    // WHEN is reserved, so a searched CASE leaves the operand empty.
    let (input, operand) = opt(expr)(input)?;
    let (input, branches) = many1(map(
        tuple((keyword("WHEN"), expr, keyword("THEN"), expr)),
        |(_, when, _, then)| (when, then),
    ))(input)?;
    let (input, else_branch) = opt(preceded(keyword("ELSE"), expr))(input)?;
    let (input, _) = keyword("END")(input)?;
    Ok((
        input,
        Expr::Case {
            operand: operand.map(Box::new),
            branches,
            else_branch: else_branch.map(Box::new),
        },
    ))
}

fn cast_expr(input: &str) -> IResult<&str, Expr> {
    map(
        tuple((
            keyword("CAST"),
            sym("("),
            expr,
            keyword("AS"),
            sql_type,
            sym(")"),
        )),
        |(_, _, inner, _, ty, _)| Expr::Cast {
            expr: Box::new(inner),
            ty,
        },
    )(input)
}

fn agg_call(input: &str) -> IResult<&str, Expr> {
    let (input, func) = alt((
        value(AggFunc::Count, keyword("COUNT")),
        value(AggFunc::Sum, keyword("SUM")),
        value(AggFunc::Avg, keyword("AVG")),
        value(AggFunc::Min, keyword("MIN")),
        value(AggFunc::Max, keyword("MAX")),
    ))(input)?;
    let (input, _) = sym("(")(input)?;

    if let Ok((rest, _)) = sym("*")(input) {
        if func != AggFunc::Count {
            return Err(error(input));
        }
        let (rest, _) = sym(")")(rest)?;
        return Ok((rest, Expr::Aggregate { func, arg: None }));
    }

    let (input, arg) = expr(input)?;
    let (input, _) = sym(")")(input)?;
    Ok((
        input,
        Expr::Aggregate {
            func,
            arg: Some(Box::new(arg)),
        },
    ))
}

fn scalar_call(input: &str) -> IResult<&str, Expr> {
    let (input, func) = alt((
        value(ScalarFunc::Upper, keyword("UPPER")),
        value(ScalarFunc::Lower, keyword("LOWER")),
        value(
            ScalarFunc::Substring,
            alt((keyword("SUBSTRING"), keyword("SUBSTR"))),
        ),
        value(ScalarFunc::Coalesce, keyword("COALESCE")),
    ))(input)?;
    let (input, args) = delimited(sym("("), separated_list1(sym(","), expr), sym(")"))(input)?;
    Ok((input, Expr::Call { func, args }))
}

fn alias(input: &str) -> IResult<&str, String> {
    alt((preceded(keyword("AS"), identifier), identifier))(input)
}

fn select_item(input: &str) -> IResult<&str, SelectItem> {
    alt((
        value(SelectItem::Wildcard, sym("*")),
        map(pair(expr, opt(alias)), |(expr, alias)| SelectItem::Expr {
            expr,
            alias,
        }),
    ))(input)
}

fn table_ref(input: &str) -> IResult<&str, TableRef> {
    map(pair(identifier, opt(alias)), |(name, alias)| TableRef {
        name,
        alias,
    })(input)
}

fn join_clause(input: &str) -> IResult<&str, JoinClause> {
    let (input, kind) = alt((
        value(JoinKind::Inner, pair(keyword("INNER"), keyword("JOIN"))),
        value(
            JoinKind::Left,
            tuple((keyword("LEFT"), opt(keyword("OUTER")), keyword("JOIN"))),
        ),
        value(
            JoinKind::Right,
            tuple((keyword("RIGHT"), opt(keyword("OUTER")), keyword("JOIN"))),
        ),
        value(JoinKind::Cross, pair(keyword("CROSS"), keyword("JOIN"))),
        value(JoinKind::Inner, keyword("JOIN")),
    ))(input)?;
    let (input, table) = table_ref(input)?;
    let (input, on) = opt(preceded(
        keyword("ON"),
        tuple((column_ref, sym("="), column_ref)),
    ))(input)?;
    Ok((
        input,
        JoinClause {
            kind,
            table,
            on: on.map(|(left, _, right)| (left, right)),
        },
    ))
}

fn select(input: &str) -> IResult<&str, Select> {
    let (input, _) = keyword("SELECT")(input)?;
    let (input, projection) = separated_list1(sym(","), select_item)(input)?;
    let (input, _) = keyword("FROM")(input)?;
    let (input, from) = table_ref(input)?;
    let (input, join) = opt(join_clause)(input)?;
    let (input, selection) = opt(preceded(keyword("WHERE"), expr))(input)?;
    let (input, group_by) = opt(preceded(
        pair(keyword("GROUP"), keyword("BY")),
        separated_list1(sym(","), column_ref),
    ))(input)?;
    let (input, having) = opt(preceded(keyword("HAVING"), expr))(input)?;
    Ok((
        input,
        Select {
            projection,
            from,
            join,
            selection,
            group_by: group_by.unwrap_or_default(),
            having,
        },
    ))
}

fn set_expr(input: &str) -> IResult<&str, SetExpr> {
    let (mut input, mut acc) = map(select, |s| SetExpr::Select(Box::new(s)))(input)?;
    loop {
        let all = if let Ok((rest, _)) = keyword("UNION")(input) {
            let (rest, all) = opt(keyword("ALL"))(rest)?;
            input = rest;
            all.is_some()
        } else {
            return Ok((input, acc));
        };
        let (rest, right) = map(select, |s| SetExpr::Select(Box::new(s)))(input)?;
        input = rest;
        acc = SetExpr::Union {
            all,
            left: Box::new(acc),
            right: Box::new(right),
        };
    }
}

fn order_key(input: &str) -> IResult<&str, OrderKey> {
    map(
        pair(
            identifier,
            opt(alt((
                value(false, keyword("ASC")),
                value(true, keyword("DESC")),
            ))),
        ),
        |(column, descending)| OrderKey {
            column,
            descending: descending.unwrap_or(false),
        },
    )(input)
}

fn query(input: &str) -> IResult<&str, Query> {
    let (input, body) = set_expr(input)?;
    let (input, order_by) = opt(preceded(
        pair(keyword("ORDER"), keyword("BY")),
        separated_list1(sym(","), order_key),
    ))(input)?;
    let (input, limit) = opt(preceded(
        keyword("LIMIT"),
        preceded(multispace0, digit1),
    ))(input)?;
    let limit = match limit {
        None => None,
        Some(text) => match text.parse::<usize>() {
            Ok(n) => Some(n),
            Err(_) => return Err(error(input)),
        },
    };
    Ok((
        input,
        Query {
            body,
            order_by: order_by.unwrap_or_default(),
            limit,
        },
    ))
}

fn column_def(input: &str) -> IResult<&str, ColumnDef> {
    map(
        tuple((
            identifier,
            sql_type,
            opt(pair(keyword("PRIMARY"), keyword("KEY"))),
        )),
        |(name, ty, pk)| ColumnDef {
            name,
            ty,
            primary_key: pk.is_some(),
        },
    )(input)
}

fn statement(input: &str) -> IResult<&str, Statement> {
    let (input, _) = keyword("CREATE")(input)?;

    if let Ok((rest, _)) = keyword("TABLE")(input) {
        let (rest, name) = identifier(rest)?;
        let (rest, columns) =
            delimited(sym("("), separated_list1(sym(","), column_def), sym(")"))(rest)?;
        return Ok((rest, Statement::CreateTable(CreateTable { name, columns })));
    }

    let (input, _) = keyword("VIEW")(input)?;
    let (input, name) = identifier(input)?;
    let (input, _) = keyword("AS")(input)?;
    let (input, query) = query(input)?;
    Ok((input, Statement::CreateView(CreateView { name, query })))
}
