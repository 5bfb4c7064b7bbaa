//! Syntax checks applied to MAIL and RCPT addresses before any filter runs.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use filter_api::MailAddress;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::char,
    combinator::{all_consuming, map_res, value, verify},
    multi::separated_list1,
    sequence::delimited,
    IResult, Parser,
};

const ATEXT_SPECIALS: &str = "!#$%&'*/?^`{|}~+-=_";

fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric() || ATEXT_SPECIALS.contains(c)
}

fn dot_atom(input: &str) -> IResult<&str, ()> {
    value((), separated_list1(char('.'), take_while1(is_atext))).parse(input)
}

fn domain_label(input: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-'),
        |label: &str| !label.starts_with('-') && !label.ends_with('-'),
    )
    .parse(input)
}

fn address_literal(input: &str) -> IResult<&str, IpAddr> {
    map_res(
        delimited(char('['), take_while1(|c: char| c != ']'), char(']')),
        |literal: &str| match literal.strip_prefix("IPv6:") {
            Some(v6) => v6.parse::<Ipv6Addr>().map(IpAddr::V6),
            None => literal.parse::<Ipv4Addr>().map(IpAddr::V4),
        },
    )
    .parse(input)
}

fn domain(input: &str) -> IResult<&str, ()> {
    alt((
        value((), address_literal),
        value((), separated_list1(tag("."), domain_label)),
    ))
    .parse(input)
}

/// Dot-separated atoms; no empty atom, no leading or trailing dot.
pub fn valid_localpart(s: &str) -> bool {
    all_consuming(dot_atom).parse(s).is_ok()
}

/// Host name of letters, digits and inner hyphens, or an address literal.
pub fn valid_domainpart(s: &str) -> bool {
    all_consuming(domain).parse(s).is_ok()
}

pub fn valid_mailaddr(addr: &MailAddress) -> bool {
    valid_localpart(&addr.user) && valid_domainpart(&addr.domain)
}

/// Drops an obsolete `route:` prefix, splitting at the first colon.
///
/// Returns whether anything was stripped.
pub fn strip_source_route(addr: &mut String) -> bool {
    match addr.find(':') {
        Some(pos) => {
            addr.drain(..=pos);
            true
        }
        None => false,
    }
}
