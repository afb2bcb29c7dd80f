mod breakpoints;
mod configuration_done;
mod dap_session;
mod mutation;
mod reconnect;
mod stepping;
mod threads;
