use std::io::{self, Write};

use mailbox::SessionReport;

pub fn print<W: Write>(report: &SessionReport, out: &mut W) -> io::Result<()> {
    for client in &report.clients {
        writeln!(
            out,
            "Client with ID {} has average time of request-respond={:.10}",
            client.process_id,
            client.mean_wait.as_secs_f64()
        )?;
    }
    writeln!(
        out,
        "Served {} requests for {} clients",
        report.cycles_served,
        report.clients.len()
    )?;
    out.flush()
}
