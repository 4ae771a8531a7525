//! Deterministic tabular rendering of an enriched traceroute, used in the
//! completion event and the plain-text views.

use super::{Hop, Host};

/// Width of the origin-details column (holder name / IX name).
const MAX_LEN_FOR_IP_DETAILS: usize = 25;

pub fn to_text(hops: &[Hop]) -> String {
    let mut res = String::new();

    // Which columns this traceroute needs.
    let mut has_loss = false;
    let mut has_rtt = false;
    let mut max_ip_len = 0;

    for hop in hops {
        for host in &hop.hosts {
            if host.loss.is_some() {
                has_loss = true;
            }

            if host.avg_rtt.is_some() {
                has_rtt = true;
            }

            max_ip_len = max_ip_len.max(display_host(host).len());
        }
    }

    let host_width = max_ip_len + 2;

    // Header.
    let mut head = format!("{:>4} {:<host_width$}", "Hop", "IP");
    if has_loss {
        head.push_str(&format!(" {:>4}", "Loss"));
    }
    if has_rtt {
        if has_loss {
            head.push_str("  ");
        }
        head.push_str(&format!("{:>10}", "RTT"));
    }
    head.push_str(&format!(
        "   {:<8} {:<MAX_LEN_FOR_IP_DETAILS$}   {}",
        "Origin", "", "Reverse"
    ));
    res.push_str(&head);
    res.push('\n');

    for hop in hops {
        if hop.hosts.is_empty() {
            res.push_str(&format!(
                "{:>4} {:<host_width$}",
                format!("{}.", hop.hop_number),
                "*"
            ));
            res.push('\n');

            continue;
        }

        let mut hosts: Vec<&Host> = hop.hosts.iter().collect();
        hosts.sort_by_key(|h| display_host(h));

        for (host_idx, host) in hosts.iter().enumerate() {
            let this_hop_txt = if host_idx == 0 {
                format!("{}.", hop.hop_number)
            } else {
                String::new()
            };

            let mut line = format!(
                "{:>4} {:<host_width$}",
                this_hop_txt,
                display_host(host)
            );

            if has_loss {
                let loss = match host.loss {
                    Some(loss) => format!("{}", loss.round() as i64),
                    None => String::new(),
                };
                line.push_str(&format!(" {loss:>3}%"));
            }

            if has_rtt {
                if has_loss {
                    line.push_str("  ");
                }
                let rtt = match host.avg_rtt {
                    Some(rtt) => format!("{rtt:>7.2}"),
                    None => String::new(),
                };
                line.push_str(&format!("{rtt:>7} ms"));
            }

            res.push_str(&line);

            // Origin/IXP detail lines. The reverse name is printed on the
            // first detail line only; further lines are indented to the
            // same column.
            let mut ip_info_line_n = 0;

            for origin in &host.origins {
                ip_info_line_n += 1;

                if ip_info_line_n > 1 {
                    res.push('\n');
                    res.push_str(&" ".repeat(line.len()));
                }

                res.push_str(&detail_line(
                    &format!("AS{}", origin.asn),
                    &shorten(&origin.holder, MAX_LEN_FOR_IP_DETAILS),
                    reverse_name(host, ip_info_line_n),
                ));
            }

            if let Some(ixp) = &host.ixp_network {
                ip_info_line_n += 1;

                if ip_info_line_n > 1 {
                    res.push('\n');
                    res.push_str(&" ".repeat(line.len()));
                }

                let ix = shorten(
                    &format!("IX: {}", ixp.ix_name.as_deref().unwrap_or("")),
                    MAX_LEN_FOR_IP_DETAILS,
                );
                res.push_str(&format!(
                    "   {:<width$}   {}",
                    ix,
                    reverse_name(host, ip_info_line_n),
                    width = MAX_LEN_FOR_IP_DETAILS + 9
                ));
            }

            // Neither origins nor an IXP network: just the reverse.
            if ip_info_line_n == 0 {
                if let Some(name) = &host.name {
                    res.push_str(&detail_line("", "", name));
                }
            }

            res.push('\n');
        }
    }

    res
}

fn display_host(host: &Host) -> String {
    host.ip
        .clone()
        .unwrap_or_else(|| host.original_host.clone())
}

fn reverse_name(host: &Host, ip_info_line_n: usize) -> &str {
    if ip_info_line_n == 1 {
        host.name.as_deref().unwrap_or("")
    } else {
        ""
    }
}

fn detail_line(origin: &str, holder: &str, name: &str) -> String {
    format!("   {origin:<8} {holder:<MAX_LEN_FOR_IP_DETAILS$}   {name}")
}

/// Collapse whitespace and truncate at a word boundary, marking the cut
/// with an ellipsis.
fn shorten(text: &str, width: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.len() <= width {
        return collapsed;
    }

    let mut out = String::new();

    for word in collapsed.split(' ') {
        let candidate_len = if out.is_empty() {
            word.len()
        } else {
            out.len() + 1 + word.len()
        };

        if candidate_len + 3 > width {
            break;
        }

        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }

    out.push_str("...");
    out
}
